//! Hierarchical media addresses.
//!
//! An address is a `/`-joined list of category segments, optionally followed
//! by `|` and a track id:
//!
//! ```text
//!   __BY_GENRE__/Rock|track-42
//!   └─ categories ─┘ └ track ┘
//! ```
//!
//! The flat string form only exists at the boundary.  Core logic resolves it
//! into a [`MediaNode`] once and branches on that.

use crate::error::AddressError;

pub const ROOT: &str = "__ROOT__";
pub const EMPTY_ROOT: &str = "__EMPTY_ROOT__";
pub const BY_GENRE: &str = "__BY_GENRE__";
pub const BY_ARTIST: &str = "__BY_ARTIST__";
pub const BY_SEARCH: &str = "__BY_SEARCH__";

pub const CATEGORY_SEPARATOR: char = '/';
pub const TRACK_SEPARATOR: char = '|';

/// Decoded form of an address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAddress {
    pub categories: Vec<String>,
    pub track_id: Option<String>,
}

impl MediaAddress {
    pub fn category_path(&self) -> Result<String, AddressError> {
        encode(&self.categories, None)
    }
}

/// Join `categories` and append `track_id` if present.
pub fn encode<S: AsRef<str>>(categories: &[S], track_id: Option<&str>) -> Result<String, AddressError> {
    if categories.is_empty() {
        return Err(AddressError::NoCategories);
    }

    let mut out = String::new();
    for (i, category) in categories.iter().enumerate() {
        let category = category.as_ref();
        if category.contains(CATEGORY_SEPARATOR) || category.contains(TRACK_SEPARATOR) {
            return Err(AddressError::InvalidCategory {
                segment: category.to_string(),
            });
        }
        if i > 0 {
            out.push(CATEGORY_SEPARATOR);
        }
        out.push_str(category);
    }

    if let Some(id) = track_id {
        out.push(TRACK_SEPARATOR);
        out.push_str(id);
    }
    Ok(out)
}

/// Split an address string.  Total: any input decodes, and a string without
/// separators is a single category.
pub fn decode(address: &str) -> MediaAddress {
    let (prefix, track_id) = match address.split_once(TRACK_SEPARATOR) {
        Some((prefix, id)) => (prefix, Some(id.to_string())),
        None => (address, None),
    };
    MediaAddress {
        categories: prefix.split(CATEGORY_SEPARATOR).map(str::to_string).collect(),
        track_id,
    }
}

/// The address with any trailing track id stripped.
pub fn category_prefix(address: &str) -> &str {
    match address.split_once(TRACK_SEPARATOR) {
        Some((prefix, _)) => prefix,
        None => address,
    }
}

/// The trailing track id, if any.
pub fn track_id(address: &str) -> Option<&str> {
    address.split_once(TRACK_SEPARATOR).map(|(_, id)| id)
}

// ── tagged node form ──────────────────────────────────────────────────────────

/// Catalog dimension a virtual category indexes by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Genre,
    Artist,
}

impl Dimension {
    pub fn root_category(self) -> &'static str {
        match self {
            Dimension::Genre => BY_GENRE,
            Dimension::Artist => BY_ARTIST,
        }
    }

    fn from_root_category(category: &str) -> Option<Self> {
        match category {
            BY_GENRE => Some(Dimension::Genre),
            BY_ARTIST => Some(Dimension::Artist),
            _ => None,
        }
    }
}

/// What a browse address points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaNode {
    Root,
    EmptyRoot,
    /// `__BY_GENRE__` or `__BY_ARTIST__`: lists the distinct keys.
    VirtualCategory(Dimension),
    /// `__BY_GENRE__/<key>`: lists the tracks under one key.
    Listing(Dimension, String),
    /// `__BY_SEARCH__/<query>`: tracks matching a free-text query.
    Search(String),
    /// Anything we don't recognise.  Resolves to nothing.
    Unknown,
}

impl MediaNode {
    /// Resolve the category part of an address.  Any trailing track id is ignored.
    pub fn parse(address: &str) -> Self {
        let prefix = category_prefix(address);
        match prefix {
            ROOT => return MediaNode::Root,
            EMPTY_ROOT => return MediaNode::EmptyRoot,
            _ => {}
        }

        let decoded = decode(prefix);
        match decoded.categories.as_slice() {
            [root] => match Dimension::from_root_category(root) {
                Some(dim) => MediaNode::VirtualCategory(dim),
                None => MediaNode::Unknown,
            },
            [root, key] if root == BY_SEARCH => MediaNode::Search(key.clone()),
            [root, key] => match Dimension::from_root_category(root) {
                Some(dim) => MediaNode::Listing(dim, key.clone()),
                None => MediaNode::Unknown,
            },
            _ => MediaNode::Unknown,
        }
    }
}
