//! Tablet identity: the key range + table pair that names a tablet.

use std::fmt;

/// Which class of tablet an extent belongs to.
///
/// The root tablet is unique and unpartitionable; metadata tablets hold the
/// system catalog; everything else is a user tablet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TabletKind {
    /// The single metadata-of-metadata tablet.
    Root,
    /// A tablet of the system catalog table.
    Metadata,
    /// A tablet of a user table.
    User,
}

/// Identifies one tablet: a table plus the exclusive end row of its range.
///
/// `end_row == None` means the tablet covers through the end of the table.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TabletId {
    kind: TabletKind,
    table: String,
    end_row: Option<Vec<u8>>,
}

impl TabletId {
    /// The root tablet.
    pub fn root() -> Self {
        Self {
            kind: TabletKind::Root,
            table: "root".into(),
            end_row: None,
        }
    }

    /// A tablet of the system catalog table.
    pub fn metadata(end_row: Option<Vec<u8>>) -> Self {
        Self {
            kind: TabletKind::Metadata,
            table: "metadata".into(),
            end_row,
        }
    }

    /// A tablet of a user table.
    pub fn user(table: impl Into<String>, end_row: Option<Vec<u8>>) -> Self {
        Self {
            kind: TabletKind::User,
            table: table.into(),
            end_row,
        }
    }

    /// Classification of this tablet.
    pub fn kind(&self) -> TabletKind {
        self.kind
    }

    /// Whether this is the root tablet.
    pub fn is_root(&self) -> bool {
        self.kind == TabletKind::Root
    }

    /// Whether this tablet belongs to the system catalog table.
    pub fn is_metadata(&self) -> bool {
        self.kind == TabletKind::Metadata
    }

    /// The table this tablet belongs to.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Exclusive end row of the tablet's range, if bounded.
    pub fn end_row(&self) -> Option<&[u8]> {
        self.end_row.as_deref()
    }
}

impl fmt::Debug for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end_row {
            Some(end) => write!(f, "{};{}", self.table, String::from_utf8_lossy(end)),
            None => write!(f, "{}<", self.table),
        }
    }
}
