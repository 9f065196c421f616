//! Board registry: the colon-delimited model database shipped in the image.
//!
//! Each row carries 15 fields:
//! `id:model:soc:fdt:uboot_overload:mainline_uboot:bootloader_img:description:
//! kernel_tags:platform:family:boot_conf:contributors:board:build`.
//! `NA` and `NULL` mark an absent value.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::warn;

use crate::error::{Error, ErrorKind, Result};

pub const FIELD_COUNT: usize = 15;

/// Id reserved for operator-supplied ("other") boards; never present in the table.
pub const CUSTOM_BOARD_ID: u32 = 0;

const PLACEHOLDERS: [&str; 2] = ["NA", "NULL"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoardRecord {
    pub id: u32,
    pub model: String,
    pub soc: String,
    pub device_tree_file: String,
    pub uboot_overload_file: Option<String>,
    pub mainline_uboot_file: Option<String>,
    pub bootloader_img_file: Option<String>,
    pub description: Option<String>,
    pub kernel_tags: Option<String>,
    pub platform: Option<String>,
    pub family: Option<String>,
    pub boot_conf: Option<String>,
    pub contributors: Option<String>,
    pub board: Option<String>,
    pub build: Option<String>,
}

/// How the caller wants the table scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FamilyFilter {
    All,
    Family(String),
}

impl FamilyFilter {
    fn admits(&self, record: &BoardRecord) -> bool {
        match self {
            FamilyFilter::All => true,
            FamilyFilter::Family(f) => record.family.as_deref() == Some(f.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    // Kept in file order; `list` sorts.
    records: Vec<BoardRecord>,
}

fn normalize(field: &str) -> Option<String> {
    let v = field.trim();
    if v.is_empty() || PLACEHOLDERS.contains(&v) {
        None
    } else {
        Some(v.to_string())
    }
}

/// Malformed rows yield `None` after a warning; only the reserved id is fatal.
fn parse_row(line_no: usize, line: &str) -> Result<Option<BoardRecord>> {
    let skip = |why: String| -> Result<Option<BoardRecord>> {
        warn!("registry line {line_no}: {why}; row skipped");
        Ok(None)
    };
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != FIELD_COUNT {
        return skip(format!(
            "expected {FIELD_COUNT} fields, found {}",
            fields.len()
        ));
    }
    let mut f = fields.into_iter().map(normalize);
    let mut next = || f.next().flatten();

    let Some(raw_id) = next() else {
        return skip("missing id".into());
    };
    let Ok(id) = raw_id.parse::<u32>() else {
        return skip(format!("invalid id '{raw_id}'"));
    };
    if id == CUSTOM_BOARD_ID {
        return Err(Error::new(
            ErrorKind::RegistryLookup,
            format!("registry line {line_no}: id {CUSTOM_BOARD_ID} is reserved"),
        ));
    }

    let model = next().unwrap_or_default();
    let soc = next().unwrap_or_default();
    let device_tree_file = next().unwrap_or_default();
    if soc.is_empty() || device_tree_file.is_empty() {
        return skip(format!("board {id} has no soc or device tree"));
    }

    Ok(Some(BoardRecord {
        id,
        model,
        soc,
        device_tree_file,
        uboot_overload_file: next(),
        mainline_uboot_file: next(),
        bootloader_img_file: next(),
        description: next(),
        kernel_tags: next(),
        platform: next(),
        family: next(),
        boot_conf: next(),
        contributors: next(),
        board: next(),
        build: next(),
    }))
}

impl Registry {
    pub fn parse(text: &str) -> Result<Self> {
        let mut records = Vec::new();
        let mut seen = BTreeSet::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some(rec) = parse_row(idx + 1, trimmed)? else {
                continue;
            };
            if !seen.insert(rec.id) {
                return Err(Error::new(
                    ErrorKind::RegistryLookup,
                    format!("registry line {}: duplicate board id {}", idx + 1, rec.id),
                ));
            }
            records.push(rec);
        }
        Ok(Self { records })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::new(
                ErrorKind::Precondition,
                format!("failed to read board registry {}: {e}", path.display()),
            )
        })?;
        Self::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows admitted by `filter`, ordered by id (stable for equal ids).
    pub fn list(&self, filter: &FamilyFilter) -> Result<Vec<&BoardRecord>> {
        let mut out: Vec<&BoardRecord> =
            self.records.iter().filter(|r| filter.admits(r)).collect();
        if out.is_empty() {
            let scope = match filter {
                FamilyFilter::All => "the registry".to_string(),
                FamilyFilter::Family(f) => format!("family '{f}'"),
            };
            return Err(Error::new(
                ErrorKind::EmptyRegistry,
                format!("no boards available for {scope}"),
            ));
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    pub fn lookup(&self, id: u32) -> Result<&BoardRecord> {
        if id == CUSTOM_BOARD_ID {
            return Err(Error::new(
                ErrorKind::RegistryLookup,
                "board id 0 is reserved for manual entry",
            ));
        }
        self.records.iter().find(|r| r.id == id).ok_or_else(|| {
            Error::new(
                ErrorKind::RegistryLookup,
                format!("board id {id} is not in the registry"),
            )
        })
    }

    /// Lookup restricted to the rows an operator was offered.
    pub fn lookup_in(&self, id: u32, filter: &FamilyFilter) -> Result<&BoardRecord> {
        let rec = self.lookup(id)?;
        if !filter.admits(rec) {
            return Err(Error::new(
                ErrorKind::RegistryLookup,
                format!("board id {id} does not belong to the current family"),
            ));
        }
        Ok(rec)
    }
}
