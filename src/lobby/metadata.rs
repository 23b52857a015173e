//! Session metadata and its blob encoding
//!
//! Blob format (version 1), fields separated by `|`:
//!
//! ```text
//! version|session_id|host_name|phase|status|joinable|total_slots|max_slots|
//! used_slots|item_id|item_name|difficulty|modifier_bits|speed
//! ```
//!
//! `|` and `\` inside text fields are escaped with `\`. Fields missing from
//! the end of a blob take the defaults from [`FIELDS`]; fields beyond the
//! known table (written by newer versions) are ignored.

use std::str::FromStr;

use tracing::warn;

use super::error::MetadataError;
use crate::transport::SessionHandle;

/// Current blob schema version
pub const METADATA_VERSION: u32 = 1;

/// Smallest allowed slot count
pub const MIN_SLOTS: usize = 2;

/// Largest session size supported
pub const DEFAULT_MAX_SLOTS: usize = 5;

const DELIMITER: char = '|';
const ESCAPE: char = '\\';

/// One entry of the blob schema
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub default: &'static str,
}

/// Field table in wire order, excluding the leading version
pub const FIELDS: [FieldSpec; 13] = [
    FieldSpec { name: "session_id", default: "0" },
    FieldSpec { name: "host_name", default: "" },
    FieldSpec { name: "phase", default: "0" },
    FieldSpec { name: "status", default: "" },
    FieldSpec { name: "joinable", default: "1" },
    FieldSpec { name: "total_slots", default: "2" },
    FieldSpec { name: "max_slots", default: "5" },
    FieldSpec { name: "used_slots", default: "0" },
    FieldSpec { name: "item_id", default: "" },
    FieldSpec { name: "item_name", default: "" },
    FieldSpec { name: "difficulty", default: "0" },
    FieldSpec { name: "modifiers", default: "0" },
    FieldSpec { name: "speed", default: "0" },
];

/// Coarse shared screen of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Before a session, or after an activity with nothing selected
    #[default]
    None = 0,
    Menu = 1,
    /// Peers are acquiring the selected item
    AwaitingDownload = 2,
    /// Every peer has the item; the activity is about to start
    ItemSelected = 3,
    InActivity = 4,
}

impl Phase {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Menu),
            2 => Some(Self::AwaitingDownload),
            3 => Some(Self::ItemSelected),
            4 => Some(Self::InActivity),
            _ => None,
        }
    }
}

/// Playback speed toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum SpeedModifier {
    #[default]
    Normal,
    Faster,
    Slower,
}

impl SpeedModifier {
    fn code(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Faster => 1,
            Self::Slower => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Normal),
            1 => Some(Self::Faster),
            2 => Some(Self::Slower),
            _ => None,
        }
    }
}

/// Named toggles applied to the shared activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ActivityModifiers {
    pub no_fail: bool,
    pub no_obstacles: bool,
    pub no_bombs: bool,
    pub insta_fail: bool,
    pub battery_energy: bool,
    pub disappearing_arrows: bool,
    pub ghost_notes: bool,
    pub speed: SpeedModifier,
}

impl ActivityModifiers {
    fn flags(&self) -> [bool; 7] {
        [
            self.no_fail,
            self.no_obstacles,
            self.no_bombs,
            self.insta_fail,
            self.battery_energy,
            self.disappearing_arrows,
            self.ghost_notes,
        ]
    }

    /// Pack the boolean toggles into a bitmask
    pub fn to_bits(&self) -> u16 {
        self.flags()
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .fold(0u16, |bits, (i, _)| bits | (1 << i))
    }

    /// Unpack toggles from a bitmask; unknown bits are ignored
    pub fn from_bits(bits: u16, speed: SpeedModifier) -> Self {
        let on = |i: u16| bits & (1 << i) != 0;
        Self {
            no_fail: on(0),
            no_obstacles: on(1),
            no_bombs: on(2),
            insta_fail: on(3),
            battery_energy: on(4),
            disappearing_arrows: on(5),
            ghost_notes: on(6),
            speed,
        }
    }
}

/// Authoritative snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub session_id: SessionHandle,
    /// Empty while the session is tearing down
    pub host_display_name: String,
    pub phase: Phase,
    pub status: String,
    /// Advisory: new peers should not be admitted when false
    pub joinable: bool,
    pub total_slots: usize,
    pub max_slots: usize,
    /// Observed member count; advisory only
    pub used_slots: usize,
    pub current_item_id: String,
    pub current_item_name: String,
    pub current_item_difficulty: u8,
    pub activity_modifiers: ActivityModifiers,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            session_id: SessionHandle::NONE,
            host_display_name: String::new(),
            phase: Phase::None,
            status: String::new(),
            joinable: true,
            total_slots: MIN_SLOTS,
            max_slots: DEFAULT_MAX_SLOTS,
            used_slots: 0,
            current_item_id: String::new(),
            current_item_name: String::new(),
            current_item_difficulty: 0,
            activity_modifiers: ActivityModifiers::default(),
        }
    }
}

impl SessionMetadata {
    /// Fresh metadata for a session the local peer just created
    pub fn hosted(session_id: SessionHandle, host_display_name: &str, max_slots: usize) -> Self {
        Self {
            session_id,
            host_display_name: host_display_name.to_string(),
            max_slots: max_slots.max(MIN_SLOTS),
            ..Self::default()
        }
    }

    /// Whether this describes a live session
    pub fn is_session(&self) -> bool {
        !self.session_id.is_none()
    }

    /// Serialize to the wire blob
    pub fn serialize(&self) -> String {
        let fields = [
            METADATA_VERSION.to_string(),
            self.session_id.raw().to_string(),
            escape(&self.host_display_name),
            self.phase.code().to_string(),
            escape(&self.status),
            u8::from(self.joinable).to_string(),
            self.total_slots.to_string(),
            self.max_slots.to_string(),
            self.used_slots.to_string(),
            escape(&self.current_item_id),
            escape(&self.current_item_name),
            self.current_item_difficulty.to_string(),
            self.activity_modifiers.to_bits().to_string(),
            self.activity_modifiers.speed.code().to_string(),
        ];
        fields.join(&DELIMITER.to_string())
    }

    /// Decode a wire blob
    pub fn parse(blob: &str) -> Result<Self, MetadataError> {
        if blob.trim().is_empty() {
            return Err(MetadataError::Empty);
        }

        let tokens = split(blob)?;
        let version = tokens[0].as_str();
        match version.parse::<u32>() {
            Ok(v) if v >= 1 => {}
            _ => return Err(MetadataError::UnsupportedVersion(version.to_string())),
        }

        let fields = FieldReader { tokens: &tokens[1..] };
        let phase_code: u8 = fields.number(2)?;
        let speed_code: u8 = fields.number(12)?;

        let metadata = Self {
            session_id: SessionHandle(fields.number(0)?),
            host_display_name: fields.text(1),
            phase: Phase::from_code(phase_code).ok_or_else(|| fields.bad(2))?,
            status: fields.text(3),
            joinable: fields.flag(4)?,
            total_slots: fields.number(5)?,
            max_slots: fields.number(6)?,
            used_slots: fields.number(7)?,
            current_item_id: fields.text(8),
            current_item_name: fields.text(9),
            current_item_difficulty: fields.number(10)?,
            activity_modifiers: ActivityModifiers::from_bits(
                fields.number(11)?,
                SpeedModifier::from_code(speed_code).ok_or_else(|| fields.bad(12))?,
            ),
        };

        if metadata.total_slots < MIN_SLOTS || metadata.total_slots > metadata.max_slots {
            return Err(MetadataError::SlotRange {
                total: metadata.total_slots,
                max: metadata.max_slots,
            });
        }

        Ok(metadata)
    }

    /// Decode a blob, degrading to "no session" on failure.
    ///
    /// The error is logged and handed back alongside the empty value so
    /// callers never mistake a partial decode for a valid snapshot.
    pub fn parse_or_none(blob: &str) -> (Self, Option<MetadataError>) {
        match Self::parse(blob) {
            Ok(metadata) => (metadata, None),
            Err(e) => {
                warn!("Discarding malformed session metadata: {}", e);
                (Self::default(), Some(e))
            }
        }
    }
}

/// Positional access to decoded tokens with schema defaults
struct FieldReader<'a> {
    tokens: &'a [String],
}

impl FieldReader<'_> {
    fn raw(&self, idx: usize) -> &str {
        self.tokens
            .get(idx)
            .map(String::as_str)
            .unwrap_or(FIELDS[idx].default)
    }

    fn bad(&self, idx: usize) -> MetadataError {
        MetadataError::BadField {
            field: FIELDS[idx].name,
            value: self.raw(idx).to_string(),
        }
    }

    fn text(&self, idx: usize) -> String {
        self.raw(idx).to_string()
    }

    fn number<T: FromStr>(&self, idx: usize) -> Result<T, MetadataError> {
        self.raw(idx).parse().map_err(|_| self.bad(idx))
    }

    fn flag(&self, idx: usize) -> Result<bool, MetadataError> {
        match self.raw(idx) {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(self.bad(idx)),
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == DELIMITER || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Split on unescaped delimiters, unescaping as we go
fn split(blob: &str) -> Result<Vec<String>, MetadataError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = blob.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(next @ (DELIMITER | ESCAPE)) => current.push(next),
                _ => return Err(MetadataError::BadEscape),
            },
            DELIMITER => tokens.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    tokens.push(current);
    Ok(tokens)
}
