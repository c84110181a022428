// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::torrent_file::Torrent;
use serde_bencode::de;
use serde_bencode::value::Value;

use std::fmt;

#[derive(Debug)]
pub enum ParseError {
    Bencode(serde_bencode::Error),
    MissingInfoDict,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::Bencode(e) => write!(f, "Bencode parsing error: {}", e),
            ParseError::MissingInfoDict => write!(f, "Missing 'info' dictionary in torrent file"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<serde_bencode::Error> for ParseError {
    fn from(e: serde_bencode::Error) -> Self {
        ParseError::Bencode(e)
    }
}

pub fn from_bytes(bencode_data: &[u8]) -> Result<Torrent, ParseError> {
    // Pull the raw info dictionary out first; its re-encoding is what the
    // info hash is computed over.
    let generic_bencode: Value = de::from_bytes(bencode_data)?;
    let info_dict_value = if let Value::Dict(mut top_level_dict) = generic_bencode {
        top_level_dict
            .remove("info".as_bytes())
            .ok_or(ParseError::MissingInfoDict)?
    } else {
        return Err(ParseError::MissingInfoDict);
    };
    let info_dict_bencode = serde_bencode::to_bytes(&info_dict_value)?;

    let mut torrent: Torrent = de::from_bytes(bencode_data)?;
    torrent.info_dict_bencode = info_dict_bencode;

    Ok(torrent)
}
