//! `ps` table decoder
//!
//! Malformed lines do not fail the listing. They are returned alongside the
//! decoded rows so the caller can decide what to show.

use serde::Serialize;

/// One `ps` row. Fields are kept as printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRow {
    pub pid: String,
    pub user: String,
    pub cpu: String,
    pub mem: String,
    /// Everything after the fourth column, internal whitespace intact
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedLine {
    /// 1-based, counting the header
    pub line_no: usize,
    pub line: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessTable {
    pub rows: Vec<ProcessRow>,
    pub skipped: Vec<SkippedLine>,
}

/// Decode `ps -eo pid,user,pcpu,pmem,args` output. The first line is the header.
pub fn decode_process_table(output: &str) -> ProcessTable {
    let mut table = ProcessTable::default();

    for (index, line) in output.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        match decode_row(line) {
            Some(row) => table.rows.push(row),
            None => table.skipped.push(SkippedLine {
                line_no: index + 1,
                line: line.to_string(),
                reason: "expected at least 5 columns".to_string(),
            }),
        }
    }
    table
}

fn decode_row(line: &str) -> Option<ProcessRow> {
    let mut rest = line;
    let mut fields = Vec::with_capacity(4);
    for _ in 0..4 {
        let (field, tail) = next_token(rest)?;
        fields.push(field.to_string());
        rest = tail;
    }

    let command = rest.trim();
    if command.is_empty() {
        return None;
    }

    let mut fields = fields.into_iter();
    Some(ProcessRow {
        pid: fields.next()?,
        user: fields.next()?,
        cpu: fields.next()?,
        mem: fields.next()?,
        command: command.to_string(),
    })
}

/// Split off the next whitespace-delimited token
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}
