//! Natural ordering for sample names ("S-2" before "S-10").
//!
//! Used as the optional pre-sort before a full plate relayout.

use std::cmp::Ordering;

use crate::model::Item;

#[derive(Debug, PartialEq, Eq)]
enum Chunk<'a> {
    Digits(&'a str),
    Text(&'a str),
}

fn chunks(input: &str) -> impl Iterator<Item = Chunk<'_>> {
    let mut rest = input;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let numeric = first.is_ascii_digit();
        let end = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != numeric)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let (chunk, tail) = rest.split_at(end);
        rest = tail;
        Some(if numeric {
            Chunk::Digits(chunk)
        } else {
            Chunk::Text(chunk)
        })
    })
}

fn compare_digits(a: &str, b: &str) -> Ordering {
    let a_trimmed = a.trim_start_matches('0');
    let b_trimmed = b.trim_start_matches('0');
    a_trimmed
        .len()
        .cmp(&b_trimmed.len())
        .then_with(|| a_trimmed.cmp(b_trimmed))
}

fn compare_text(a: &str, b: &str) -> Ordering {
    let a_lower = a.chars().flat_map(char::to_lowercase);
    let b_lower = b.chars().flat_map(char::to_lowercase);
    a_lower.cmp(b_lower)
}

/// Compares two strings treating embedded digit runs as numbers and letters
/// case-insensitively. Ties fall back to plain byte order so the ordering is
/// total.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = chunks(a);
    let mut right = chunks(b);
    loop {
        let ordering = match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(Chunk::Digits(x)), Some(Chunk::Digits(y))) => compare_digits(x, y),
            (Some(Chunk::Text(x)), Some(Chunk::Text(y))) => compare_text(x, y),
            (Some(Chunk::Digits(_)), Some(Chunk::Text(_))) => Ordering::Less,
            (Some(Chunk::Text(_)), Some(Chunk::Digits(_))) => Ordering::Greater,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

/// Natural order of items by name, falling back to the id for unnamed items.
pub fn compare_items(a: &Item, b: &Item) -> Ordering {
    natural_cmp(a.sort_label(), b.sort_label()).then_with(|| a.id.cmp(&b.id))
}
