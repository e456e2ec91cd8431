// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Minimal helpers for the handful of XML documents WSAA exchanges.
//!
//! The documents are small and flat, so rather than mapping them to full schemas we pull out
//! the text of individual elements by their local (namespace-free) name.

use quick_xml::{events::Event, Reader};

/// Return the text content of the first element with the given local name.
///
/// Entities are unescaped and CDATA sections are included verbatim. Returns `Ok(None)` if
/// the document contains no such element.
pub(crate) fn element_text(document: &str, name: &str) -> Result<Option<String>, String> {
    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event().map_err(|error| error.to_string())? {
            Event::Start(start) if start.local_name().as_ref() == name.as_bytes() => break,
            Event::Empty(empty) if empty.local_name().as_ref() == name.as_bytes() => {
                return Ok(Some(String::new()))
            }
            Event::Eof => return Ok(None),
            _ => continue,
        }
    }

    let mut text = String::new();
    loop {
        match reader.read_event().map_err(|error| error.to_string())? {
            Event::Text(content) => {
                text.push_str(&content.unescape().map_err(|error| error.to_string())?)
            }
            Event::CData(content) => text.push_str(&String::from_utf8_lossy(&content)),
            Event::End(_) => return Ok(Some(text)),
            Event::Start(_) | Event::Empty(_) => {
                return Err(format!("<{name}> is expected to contain only text"))
            }
            Event::Eof => return Err(format!("<{name}> is never closed")),
            _ => continue,
        }
    }
}

/// Like [`element_text`], but the element must be present.
pub(crate) fn required_text(document: &str, name: &str) -> Result<String, String> {
    element_text(document, name)?.ok_or_else(|| format!("missing <{name}> element"))
}
