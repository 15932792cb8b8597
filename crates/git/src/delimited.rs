//! NUL-delimited output parsing for `git log` and `git for-each-ref`.
//!
//! Both commands can emit user-controlled text (commit messages, branch
//! names) containing any byte except NUL, so NUL is the only safe field
//! separator. The two commands need different treatments:
//!
//! - `log` takes `-z`, which terminates each record with NUL, so the
//!   whole stream is a flat NUL-separated token list;
//! - `for-each-ref` has no `-z`, so each record keeps its trailing
//!   newline. Wrapping the format string in `%00...%00` isolates that
//!   newline as its own token, which doubles as a per-record integrity
//!   check.

use crate::exec::GitError;

/// Format arguments for `git log` with `field_count` custom fields per
/// record, NUL-separated and NUL-terminated.
pub(crate) fn log_format_args(fields: &[&str]) -> Vec<String> {
    vec!["-z".to_string(), format!("--format={}", fields.join("%x00"))]
}

/// Split `-z` log output into records of `field_count` fields each.
pub(crate) fn parse_log_records(
    stdout: &str,
    field_count: usize,
) -> Result<Vec<Vec<String>>, GitError> {
    let mut tokens: Vec<&str> = stdout.split('\0').collect();

    // An empty stream splits into a single empty token.
    if tokens == [""] {
        return Ok(Vec::new());
    }
    // Every record is NUL-terminated, so a well-formed stream is some
    // multiple of `field_count` tokens followed by one empty token.
    if tokens.last() != Some(&"") || (tokens.len() - 1) % field_count != 0 {
        return Err(GitError::Malformed(format!(
            "log output had {} fields, not a multiple of {field_count}",
            tokens.len() - 1
        )));
    }
    tokens.pop();

    Ok(tokens
        .chunks_exact(field_count)
        .map(|chunk| chunk.iter().map(|t| t.to_string()).collect())
        .collect())
}

/// The format argument for `git for-each-ref` with the given
/// `%(...)` field atoms.
pub(crate) fn for_each_ref_format_arg(fields: &[&str]) -> String {
    format!("--format=%00{}%00", fields.join("%00"))
}

/// Split for-each-ref output into records of `field_count` fields each,
/// verifying the newline that separates records.
pub(crate) fn parse_ref_records(
    stdout: &str,
    field_count: usize,
) -> Result<Vec<Vec<String>>, GitError> {
    let tokens: Vec<&str> = stdout.split('\0').collect();
    let mut records = Vec::new();
    let mut current: Vec<String> = Vec::with_capacity(field_count);

    // The format string starts and ends with %00, so the first token is
    // always empty and the last token is the final record terminator;
    // neither carries data.
    let end = tokens.len().saturating_sub(1);
    for (i, token) in tokens.iter().enumerate().take(end).skip(1) {
        if i % (field_count + 1) == 0 {
            if *token != "\n" {
                return Err(GitError::Malformed(
                    "expected newline between ref records".to_string(),
                ));
            }
            continue;
        }

        current.push((*token).to_string());
        if current.len() == field_count {
            records.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        return Err(GitError::Malformed(
            "truncated ref record at end of output".to_string(),
        ));
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_args_join_fields_with_nul_escape() {
        assert_eq!(
            log_format_args(&["%H", "%s"]),
            vec!["-z".to_string(), "--format=%H%x00%s".to_string()]
        );
    }

    #[test]
    fn log_records_chunk_and_drop_terminator() {
        let stdout = "sha1\0one\0sha2\0two\0";
        let records = parse_log_records(stdout, 2).unwrap();
        assert_eq!(
            records,
            vec![
                vec!["sha1".to_string(), "one".to_string()],
                vec!["sha2".to_string(), "two".to_string()],
            ]
        );
    }

    #[test]
    fn log_records_keep_embedded_newlines() {
        let stdout = "sha1\0line one\nline two\0";
        let records = parse_log_records(stdout, 2).unwrap();
        assert_eq!(records[0][1], "line one\nline two");
    }

    #[test]
    fn empty_log_output_yields_no_records() {
        assert!(parse_log_records("", 3).unwrap().is_empty());
    }

    #[test]
    fn partial_log_record_is_an_error() {
        assert!(parse_log_records("sha1\0one\0sha2\0", 2).is_err());
    }

    #[test]
    fn ref_records_verify_separating_newline() {
        let stdout = "\0refs/heads/main\0abc\0\n\0refs/heads/dev\0def\0\n";
        let records = parse_ref_records(stdout, 2).unwrap();
        assert_eq!(
            records,
            vec![
                vec!["refs/heads/main".to_string(), "abc".to_string()],
                vec!["refs/heads/dev".to_string(), "def".to_string()],
            ]
        );

        let corrupt = "\0refs/heads/main\0abc\0X\0refs/heads/dev\0def\0\n";
        assert!(parse_ref_records(corrupt, 2).is_err());
    }

    #[test]
    fn empty_ref_output_yields_no_records() {
        assert!(parse_ref_records("", 4).unwrap().is_empty());
    }
}
