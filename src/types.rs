use crate::error::{ProximityError, Result};
use crate::spatial::Point;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_ADDRESS_LEN: usize = 500;
pub const MAX_PHONE_LEN: usize = 20;
pub const MAX_HOURS_LEN: usize = 100;

/// Per-entity monotonic counter, 0 on creation
pub type Version = u64;

/// Store-assigned business identifier.
///
/// Ids are random v4 UUIDs and are never reused once deleted. Their byte
/// order is the tie-break for equal distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessId(Uuid);

impl BusinessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BusinessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BusinessId {
    type Err = ProximityError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ProximityError::validation("id", format!("'{}' is not a valid id", s)))
    }
}

impl From<Uuid> for BusinessId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Fixed set of business categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    KoreanFood,
    ChineseFood,
    JapaneseFood,
    WesternFood,
    Cafe,
    Bar,
    Convenience,
    Pharmacy,
    HairSalon,
    Gym,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::KoreanFood,
        Category::ChineseFood,
        Category::JapaneseFood,
        Category::WesternFood,
        Category::Cafe,
        Category::Bar,
        Category::Convenience,
        Category::Pharmacy,
        Category::HairSalon,
        Category::Gym,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::KoreanFood => "korean_food",
            Category::ChineseFood => "chinese_food",
            Category::JapaneseFood => "japanese_food",
            Category::WesternFood => "western_food",
            Category::Cafe => "cafe",
            Category::Bar => "bar",
            Category::Convenience => "convenience",
            Category::Pharmacy => "pharmacy",
            Category::HairSalon => "hair_salon",
            Category::Gym => "gym",
        }
    }

    /// Position in [`Category::ALL`], used for per-category tables
    pub fn ordinal(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ProximityError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| {
                let allowed: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
                ProximityError::validation(
                    "category",
                    format!("'{}' is not allowed; expected one of {:?}", s, allowed),
                )
            })
    }
}

/// The only entity: a business with a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Business {
    pub id: BusinessId,
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub category: Category,
    pub phone: Option<String>,
    pub hours: Option<String>,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Business {
    /// Materialize a validated draft as a fresh record at version 0
    pub fn create(id: BusinessId, draft: BusinessDraft, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name,
            address: draft.address,
            latitude: draft.latitude,
            longitude: draft.longitude,
            category: draft.category,
            phone: draft.phone,
            hours: draft.hours,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Produce the next version of this record with the draft's fields
    pub fn revise(&self, draft: BusinessDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            name: draft.name,
            address: draft.address,
            latitude: draft.latitude,
            longitude: draft.longitude,
            category: draft.category,
            phone: draft.phone,
            hours: draft.hours,
            version: self.version + 1,
            created_at: self.created_at,
            updated_at: now,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.latitude, self.longitude)
    }

    /// Geohash bucket of this record's location at `precision`
    pub fn location_bucket(&self, precision: usize) -> Result<String> {
        self.point().to_geohash(precision)
    }
}

/// User-supplied fields for a create, seed, or full update
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessDraft {
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub category: Category,
    pub phone: Option<String>,
    pub hours: Option<String>,
}

impl BusinessDraft {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        latitude: f64,
        longitude: f64,
        category: Category,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            latitude,
            longitude,
            category,
            phone: None,
            hours: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_hours(mut self, hours: impl Into<String>) -> Self {
        self.hours = Some(hours.into());
        self
    }

    pub fn point(&self) -> Point {
        Point::new(self.latitude, self.longitude)
    }

    /// Reject anything that must never reach the store.
    pub fn validate(&self) -> Result<()> {
        require_text("name", &self.name, MAX_NAME_LEN)?;
        require_text("address", &self.address, MAX_ADDRESS_LEN)?;
        self.point().validate()?;
        if let Some(phone) = &self.phone {
            limit_text("phone", phone, MAX_PHONE_LEN)?;
        }
        if let Some(hours) = &self.hours {
            limit_text("hours", hours, MAX_HOURS_LEN)?;
        }
        Ok(())
    }
}

/// Full replacement of a business's fields.
///
/// With `expected_version` set the update is a compare-and-swap; without it
/// the update applies to whatever version is current.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessUpdate {
    pub fields: BusinessDraft,
    pub expected_version: Option<Version>,
}

impl BusinessUpdate {
    pub fn new(fields: BusinessDraft) -> Self {
        Self {
            fields,
            expected_version: None,
        }
    }

    pub fn expecting(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
        self
    }
}

fn require_text(field: &'static str, value: &str, max: usize) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ProximityError::validation(field, "must not be blank"));
    }
    limit_text(field, value, max)
}

fn limit_text(field: &'static str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(ProximityError::validation(
            field,
            format!("must be at most {} characters", max),
        ));
    }
    Ok(())
}
