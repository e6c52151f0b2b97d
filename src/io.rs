//! Delimited-text import of rating data.
//!
//! Rating files carry one interaction per line, for example
//!
//! ```text
//! 196	242	3.0
//! 186	302	3.0
//! ```
//!
//! External entity tokens are arbitrary strings; an [`IdMapping`] turns
//! them into the dense internal ids the store and the models work with.
//! Reuse the same mappings across training and test files so ids agree.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::data::Ratings;
use crate::Error;

/// Shape of a delimited rating file.
#[derive(Clone, Debug)]
pub struct TextFormat {
    delimiter: u8,
    user_column: usize,
    item_column: usize,
    rating_column: usize,
    has_header: bool,
}

impl Default for TextFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl TextFormat {
    /// Tab-separated `user item rating` columns without a header.
    pub fn new() -> Self {
        TextFormat {
            delimiter: b'\t',
            user_column: 0,
            item_column: 1,
            rating_column: 2,
            has_header: false,
        }
    }

    /// Set the field delimiter.
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set the zero-based column holding the user token.
    pub fn user_column(mut self, user_column: usize) -> Self {
        self.user_column = user_column;
        self
    }

    /// Set the zero-based column holding the item token.
    pub fn item_column(mut self, item_column: usize) -> Self {
        self.item_column = item_column;
        self
    }

    /// Set the zero-based column holding the rating value.
    pub fn rating_column(mut self, rating_column: usize) -> Self {
        self.rating_column = rating_column;
        self
    }

    /// Skip the first line as a header.
    pub fn has_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }
}

/// A reversible mapping from external string tokens to dense internal
/// ids, assigned in order of first appearance.
#[derive(Clone, Debug, Default)]
pub struct IdMapping {
    ids: HashMap<String, usize>,
    tokens: Vec<String>,
}

impl IdMapping {
    /// Create an empty mapping.
    pub fn new() -> Self {
        IdMapping::default()
    }

    /// The internal id for `token`, assigning the next free id on first
    /// sight.
    pub fn id(&mut self, token: &str) -> usize {
        if let Some(&id) = self.ids.get(token) {
            return id;
        }
        let id = self.tokens.len();
        self.ids.insert(token.to_string(), id);
        self.tokens.push(token.to_string());
        id
    }

    /// The internal id for `token`, if it has been seen.
    pub fn try_id(&self, token: &str) -> Option<usize> {
        self.ids.get(token).copied()
    }

    /// The external token for an internal id.
    pub fn token(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }

    /// The number of distinct tokens seen.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Read a delimited rating file into a store, mapping entity tokens
/// through the supplied mappings.
///
/// Malformed lines (missing columns, unparseable ratings) surface as
/// [`Error::Format`] naming the line number.
pub fn read_ratings<R: Read>(
    reader: R,
    format: &TextFormat,
    users: &mut IdMapping,
    items: &mut IdMapping,
) -> Result<Ratings, Error> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(format.delimiter)
        .has_headers(format.has_header)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut ratings = Ratings::new();
    for record in csv_reader.records() {
        let record = record.map_err(|error| Error::Format(error.to_string()))?;
        let line = record.position().map_or(0, csv::Position::line);

        let user_token = record.get(format.user_column).ok_or_else(|| {
            Error::Format(format!(
                "line {}: missing user column {}",
                line, format.user_column
            ))
        })?;
        let item_token = record.get(format.item_column).ok_or_else(|| {
            Error::Format(format!(
                "line {}: missing item column {}",
                line, format.item_column
            ))
        })?;
        let rating_token = record.get(format.rating_column).ok_or_else(|| {
            Error::Format(format!(
                "line {}: missing rating column {}",
                line, format.rating_column
            ))
        })?;

        let value: f32 = rating_token.parse().map_err(|_| {
            Error::Format(format!(
                "line {}: cannot parse rating '{}'",
                line, rating_token
            ))
        })?;

        ratings.add(users.id(user_token), items.id(item_token), value)?;
    }

    Ok(ratings)
}

/// Read a delimited rating file from disk.
pub fn read_ratings_from_path<P: AsRef<Path>>(
    path: P,
    format: &TextFormat,
    users: &mut IdMapping,
    items: &mut IdMapping,
) -> Result<Ratings, Error> {
    let file = File::open(path)?;
    read_ratings(file, format, users, items)
}
