#![allow(dead_code)]

use std::fmt;

pub struct Record {
    pub kind: char,
    pub fields: Vec<u64>,
}

/// Parse the tracker's own records, skipping any host-written lines.
pub fn parse_event_lines(output: &str) -> Vec<Record> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split(' ');
            let kind = parts.next()?.chars().next()?;
            if !matches!(kind, 'h' | '+' | '-' | '~') {
                return None;
            }
            let fields = parts
                .map(|field| u64::from_str_radix(field, 16).expect("malformed record field"))
                .collect();
            Some(Record { kind, fields })
        })
        .collect()
}

pub fn warning_to_stderr(args: fmt::Arguments<'_>) {
    eprintln!("{}", args);
}
