// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Minimal HTTP/1.0 response-head parser for the stream transport.  Only
//! status and `Content-Length` matter; anything else about the reply that
//! looks unusual makes the caller fall back to the datagram transport.

/// Parsed pieces of a response head.  Borrows from the caller's read
/// buffer; `body` is whatever followed the blank line.
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseHead<'a> {
    pub status: u16,
    pub reason: &'a str,
    pub content_length: Option<u64>,
    pub body: &'a [u8],
}

/// Offset of the first body byte if the buffer already contains the
/// blank-line terminator (`\n\n` or `\n\r\n`), else `None`.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    for (idx, pair) in buf.windows(2).enumerate() {
        if pair == b"\n\n" {
            return Some(idx + 2);
        }
        if pair == b"\n\r" && buf.get(idx + 2) == Some(&b'\n') {
            return Some(idx + 3);
        }
    }
    None
}

/// Parse a response head known to contain its terminator (see
/// [`header_end`]).  Nul bytes inside the header region are tolerated;
/// some chatty peers are driven by hand over telnet.
pub fn parse_response_head(buf: &[u8]) -> anyhow::Result<ResponseHead<'_>> {
    let body_start = header_end(buf)
        .ok_or_else(|| anyhow::anyhow!("response head missing blank-line terminator"))?;
    let head = &buf[..body_start];

    let rest = head
        .strip_prefix(b"HTTP/1.0 ")
        .ok_or_else(|| anyhow::anyhow!("missing HTTP/1.0 preamble"))?;
    if rest.len() < 4
        || !rest[..3].iter().all(u8::is_ascii_digit)
        || rest[3] != b' '
    {
        anyhow::bail!("missing three-digit status code");
    }
    let status = (u16::from(rest[0] - b'0')) * 100
        + u16::from(rest[1] - b'0') * 10
        + u16::from(rest[2] - b'0');

    let line_end = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| anyhow::anyhow!("unterminated status line"))?;
    let reason_bytes = trim_cr(&rest[4..line_end]);
    let reason = std::str::from_utf8(reason_bytes).unwrap_or("");

    let mut content_length = None;
    for line in rest[line_end + 1..].split(|&b| b == b'\n') {
        let line = trim_cr(line);
        if line.is_empty() {
            break;
        }
        if let Some(value) = header_value(line, b"content-length:") {
            content_length = Some(parse_decimal(value)?);
        }
    }

    Ok(ResponseHead {
        status,
        reason,
        content_length,
        body: &buf[body_start..],
    })
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Case-insensitive header match; returns the value with leading spaces
/// stripped.
fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() < name.len() || !line[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let mut value = &line[name.len()..];
    while let Some((&b' ', rest)) = value.split_first() {
        value = rest;
    }
    Some(value)
}

fn parse_decimal(bytes: &[u8]) -> anyhow::Result<u64> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        anyhow::bail!("malformed Content-Length header");
    }
    let mut value: u64 = 0;
    for &d in bytes {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(d - b'0')))
            .ok_or_else(|| anyhow::anyhow!("Content-Length overflows"))?;
    }
    Ok(value)
}
