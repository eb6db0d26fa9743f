//! Formatting of interpreter error records for the host.

use std::fmt::Write;

use crate::engine::ErrorRecord;

/// Format a batch of error records, one block per record.
pub fn format_errors(errors: &[ErrorRecord]) -> String {
    errors
        .iter()
        .map(format_error)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format one error record and its nested causes.
///
/// ```text
/// Cannot find path 'C:\nope'.
/// At line:1 char:1
///     + CategoryInfo          : ObjectNotFound
///     + FullyQualifiedErrorId : PathNotFound,Get-Item
///     ---> Caused by: access denied
/// ```
pub fn format_error(record: &ErrorRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", record.message);
    if let Some(position) = &record.position {
        let _ = writeln!(out, "At {position}");
    }
    if !record.category.is_empty() {
        let _ = writeln!(out, "    + CategoryInfo          : {}", record.category);
    }
    if !record.fully_qualified_error_id.is_empty() {
        let _ = writeln!(
            out,
            "    + FullyQualifiedErrorId : {}",
            record.fully_qualified_error_id
        );
    }

    let mut depth = 1;
    let mut cause = record.cause.as_deref();
    while let Some(inner) = cause {
        let indent = "    ".repeat(depth);
        let _ = writeln!(out, "{indent}---> Caused by: {}", inner.message);
        if !inner.fully_qualified_error_id.is_empty() {
            let _ = writeln!(out, "{indent}     ({})", inner.fully_qualified_error_id);
        }
        cause = inner.cause.as_deref();
        depth += 1;
    }

    out.truncate(out.trim_end().len());
    out
}
