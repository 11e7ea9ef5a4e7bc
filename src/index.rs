//! Unicode character name index.
//!
//! Maps every word that appears in a character name to the set of characters
//! carrying it. A query matches the characters whose names contain all of the
//! query's words. Construction walks the whole name table and is slow; lookups
//! are read-only and safe to run from many connections at once.

use crate::error::LoadError;
use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// First code point that is indexed. Everything below is a control character.
const FIRST_INDEXED: u32 = 0x20;

/// Where the character names come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSource {
    /// Name table compiled into the binary.
    Builtin,
    /// A file in the `UnicodeData.txt` format (`code;NAME;...`).
    UnicodeData(PathBuf),
}

impl IndexSource {
    /// Build the index. Blocking; run it off the I/O path.
    pub fn build(&self) -> Result<CharIndex, LoadError> {
        let index = match self {
            IndexSource::Builtin => CharIndex::from_names(builtin_names()),
            IndexSource::UnicodeData(path) => CharIndex::from_unicode_data_file(path)?,
        };

        if index.is_empty() {
            return Err(LoadError::Empty);
        }

        info!(
            chars = index.char_count(),
            words = index.word_count(),
            "Index built"
        );
        Ok(index)
    }
}

/// In-memory word index over character names
#[derive(Debug, Default)]
pub struct CharIndex {
    /// Upper-cased word -> characters whose name contains it
    words: BTreeMap<String, BTreeSet<char>>,
    /// Character -> full name
    names: BTreeMap<char, String>,
}

impl CharIndex {
    /// Build an index from `(char, name)` pairs.
    ///
    /// Control characters and placeholder names such as `<control>` are
    /// skipped.
    pub fn from_names<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (char, S)>,
        S: Into<String>,
    {
        let mut index = CharIndex::default();
        for (ch, name) in entries {
            index.insert(ch, name.into());
        }
        index
    }

    /// Build an index from a reader yielding `UnicodeData.txt` lines.
    ///
    /// `path` is used only for error reporting.
    pub fn from_unicode_data<R: BufRead>(reader: R, path: &Path) -> Result<Self, LoadError> {
        let mut index = CharIndex::default();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (ch, name) = parse_unicode_data_line(line).map_err(|reason| {
                LoadError::Malformed {
                    path: path.to_path_buf(),
                    line: line_no + 1,
                    reason,
                }
            })?;
            index.insert(ch, name.to_string());
        }

        Ok(index)
    }

    /// Open and parse a `UnicodeData.txt` file.
    pub fn from_unicode_data_file(path: &Path) -> Result<Self, LoadError> {
        debug!(path = %path.display(), "Reading character data");
        let file = std::fs::File::open(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_unicode_data(std::io::BufReader::new(file), path)
    }

    fn insert(&mut self, ch: char, name: String) {
        if (ch as u32) < FIRST_INDEXED || name.starts_with('<') || name.is_empty() {
            return;
        }
        for word in tokenize(&name) {
            self.words.entry(word).or_default().insert(ch);
        }
        self.names.insert(ch, name);
    }

    /// Characters matching every word of `query`, lazily rendered as
    /// description lines in ascending code point order.
    pub fn find_matches(&self, query: &str) -> Matches<'_> {
        Matches {
            chars: self.matching_chars(query).into_iter(),
            names: &self.names,
        }
    }

    fn matching_chars(&self, query: &str) -> BTreeSet<char> {
        let mut sets = Vec::new();
        for word in tokenize(query) {
            match self.words.get(&word) {
                Some(chars) => sets.push(chars),
                None => return BTreeSet::new(),
            }
        }

        // Intersect starting from the smallest set
        sets.sort_by_key(|chars| chars.len());
        let mut iter = sets.into_iter();
        let Some(first) = iter.next() else {
            return BTreeSet::new();
        };
        let mut result = first.clone();
        for chars in iter {
            result.retain(|ch| chars.contains(ch));
            if result.is_empty() {
                break;
            }
        }
        result
    }

    /// Summary line for a query that produced `match_count` results.
    pub fn status_line(&self, query: &str, match_count: usize) -> String {
        let msg = match match_count {
            0 => "No match".to_string(),
            1 => "1 match".to_string(),
            n => format!("{n} matches"),
        };
        format!("{msg} for {}", quoted(query))
    }

    pub fn char_count(&self) -> usize {
        self.names.len()
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Lazy iterator over match descriptions. Finite and not restartable.
pub struct Matches<'a> {
    chars: std::collections::btree_set::IntoIter<char>,
    names: &'a BTreeMap<char, String>,
}

impl Iterator for Matches<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let ch = self.chars.next()?;
        let name = self.names.get(&ch).map(String::as_str).unwrap_or_default();
        Some(describe(ch, name))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chars.size_hint()
    }
}

/// Render one match: `U+1F431\t🐱\tCAT FACE`
pub fn describe(ch: char, name: &str) -> String {
    format!("U+{:04X}\t{}\t{}", ch as u32, ch, name)
}

/// Quote a query for display: single quotes unless the text contains a
/// single quote and no double quote. Backslashes, the chosen quote and
/// control characters are escaped.
fn quoted(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.extend(c.escape_default()),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Split text into upper-cased words (runs of alphanumerics or `_`).
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .map(str::to_uppercase)
}

/// Parse `0041;LATIN CAPITAL LETTER A;Lu;...` into its character and name.
fn parse_unicode_data_line(line: &str) -> Result<(char, &str), String> {
    let mut fields = line.split(';');
    let code = fields.next().unwrap_or_default().trim();
    let name = fields
        .next()
        .ok_or_else(|| "missing name field".to_string())?
        .trim();

    let value =
        u32::from_str_radix(code, 16).map_err(|e| format!("bad code point {code:?}: {e}"))?;
    let ch = char::from_u32(value).ok_or_else(|| format!("U+{value:04X} is not a scalar value"))?;
    Ok((ch, name))
}

/// Every named scalar value from the compiled-in table.
fn builtin_names() -> impl Iterator<Item = (char, String)> {
    (FIRST_INDEXED..=char::MAX as u32)
        .filter_map(char::from_u32)
        .filter_map(|ch| unicode_names2::name(ch).map(|name| (ch, name.to_string())))
}
