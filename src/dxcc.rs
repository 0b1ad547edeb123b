//! DXCC prefix database and callsign resolution.
//!
//! Loads a cty.csv-style reference table into an in-memory prefix map and
//! resolves callsigns to their DXCC entity by longest-prefix match. The
//! resolver is pure after load: no disk or network access at lookup time, so
//! it can run at line-parsing throughput.
//!
//! # Table format
//!
//! One row per entity: primary prefix, country name, DXCC code, continent,
//! CQ zone, ITU zone, latitude, longitude, UTC offset, and an alias field of
//! space-separated prefix tokens terminated by `;`. An alias token is a
//! prefix (a leading `=` marks an exact callsign), optionally followed by
//! zone or continent overrides:
//!
//! ```text
//! K,United States,291,NA,5,8,37.53,-91.67,5.0,AA AB W N KH6(31)[61] =W1AW(5);
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, digit1},
    combinator::{map, map_res, opt, value},
    multi::many0,
    sequence::delimited,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// One geographic/administrative entity record. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DxccEntity {
    /// The prefix this record was registered under.
    pub prefix: String,

    /// Country name.
    pub country: String,

    /// Two-letter continent code (NA, SA, EU, AF, AS, OC, AN).
    pub continent: String,

    /// CQ zone.
    pub cq_zone: u16,

    /// ITU zone.
    pub itu_zone: u16,

    /// Latitude in degrees, north positive.
    pub latitude: f64,

    /// Longitude in degrees.
    pub longitude: f64,

    /// UTC offset in hours.
    pub utc_offset: f64,
}

/// Lookup failure: no prefix in the table matches the callsign.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no DXCC prefix matches \"{0}\"")]
    NotFound(String),
}

/// In-memory prefix map with longest-prefix lookup.
pub struct DxccResolver {
    map: HashMap<String, DxccEntity>,
    max_prefix_len: usize,
}

impl DxccResolver {
    /// Load the prefix table from a file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open prefix table {}", path.display()))?;
        Self::from_reader(file)
            .with_context(|| format!("failed to parse prefix table {}", path.display()))
    }

    /// Load the prefix table from any reader.
    pub fn from_reader<R: Read>(input: R) -> Result<Self> {
        let mut map = HashMap::new();
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(input);

        for (index, row) in rdr.records().enumerate() {
            let row = row.with_context(|| format!("prefix table row {}", index + 1))?;
            let base =
                entity_from_row(&row).with_context(|| format!("prefix table row {}", index + 1))?;
            let aliases = parse_aliases(row.get(9).unwrap_or_default());
            map.insert(base.prefix.clone(), base.clone());
            for alias in aliases {
                let entity = alias.apply(&base);
                map.insert(entity.prefix.clone(), entity);
            }
        }

        if map.is_empty() {
            anyhow::bail!("prefix table is empty");
        }
        let max_prefix_len = map.keys().map(String::len).max().unwrap_or(0);
        debug!("loaded {} prefixes (longest {max_prefix_len})", map.len());
        Ok(Self {
            map,
            max_prefix_len,
        })
    }

    /// Number of prefixes in the table.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table is empty. Never true after a successful load.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Resolve a callsign to its entity by longest-prefix match.
    ///
    /// Tries every leading substring of the uppercased callsign from the
    /// longest registered prefix length down to one character. Callers must
    /// strip operator suffixes (`/P`, `/MM`, the skimmer `-#` marker) first;
    /// the resolver does not guess suffix semantics.
    pub fn lookup(&self, callsign: &str) -> Result<&DxccEntity, LookupError> {
        let call = callsign.trim().to_ascii_uppercase();
        if call.is_empty() || !call.is_ascii() {
            return Err(LookupError::NotFound(callsign.to_string()));
        }
        let longest = call.len().min(self.max_prefix_len);
        for end in (1..=longest).rev() {
            if let Some(entity) = self.map.get(&call[..end]) {
                return Ok(entity);
            }
        }
        Err(LookupError::NotFound(callsign.to_string()))
    }
}

fn column<'r>(row: &'r csv::StringRecord, i: usize) -> Result<&'r str> {
    row.get(i)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing column {i}"))
}

/// Build the base entity from the fixed columns of one table row.
fn entity_from_row(row: &csv::StringRecord) -> Result<DxccEntity> {
    Ok(DxccEntity {
        prefix: column(row, 0)?.trim_matches('*').to_ascii_uppercase(),
        country: column(row, 1)?.to_string(),
        continent: column(row, 3)?.to_ascii_uppercase(),
        cq_zone: column(row, 4)?.parse().context("CQ zone")?,
        itu_zone: column(row, 5)?.parse().context("ITU zone")?,
        latitude: column(row, 6)?.parse().context("latitude")?,
        longitude: column(row, 7)?.parse().context("longitude")?,
        utc_offset: column(row, 8)?.parse().context("UTC offset")?,
    })
}

/// One alias token: a prefix plus the overrides layered on the base record.
struct AliasSpec {
    prefix: String,
    cq_zone: Option<u16>,
    itu_zone: Option<u16>,
    continent: Option<String>,
}

impl AliasSpec {
    fn apply(&self, base: &DxccEntity) -> DxccEntity {
        DxccEntity {
            prefix: self.prefix.clone(),
            country: base.country.clone(),
            continent: self
                .continent
                .clone()
                .unwrap_or_else(|| base.continent.clone()),
            cq_zone: self.cq_zone.unwrap_or(base.cq_zone),
            itu_zone: self.itu_zone.unwrap_or(base.itu_zone),
            latitude: base.latitude,
            longitude: base.longitude,
            utc_offset: base.utc_offset,
        }
    }
}

#[derive(Clone)]
enum AliasOverride {
    CqZone(u16),
    ItuZone(u16),
    Continent(String),
    /// Coordinate and timezone overrides are recognized but not carried.
    Ignored,
}

fn alias_override(input: &str) -> IResult<&str, AliasOverride> {
    alt((
        map(
            delimited(
                char('('),
                map_res(digit1, |s: &str| s.parse::<u16>()),
                char(')'),
            ),
            AliasOverride::CqZone,
        ),
        map(
            delimited(
                char('['),
                map_res(digit1, |s: &str| s.parse::<u16>()),
                char(']'),
            ),
            AliasOverride::ItuZone,
        ),
        map(
            delimited(
                char('{'),
                take_while1(|c: char| c.is_ascii_alphabetic()),
                char('}'),
            ),
            |c: &str| AliasOverride::Continent(c.to_ascii_uppercase()),
        ),
        value(
            AliasOverride::Ignored,
            delimited(char('<'), take_while1(|c: char| c != '>'), char('>')),
        ),
        value(
            AliasOverride::Ignored,
            delimited(char('~'), take_while1(|c: char| c != '~'), char('~')),
        ),
    ))
    .parse(input)
}

fn alias_token(input: &str) -> IResult<&str, AliasSpec> {
    let (input, _) = opt(char('=')).parse(input)?;
    let (input, prefix) =
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '/').parse(input)?;
    let (input, overrides) = many0(alias_override).parse(input)?;

    let mut spec = AliasSpec {
        prefix: prefix.to_ascii_uppercase(),
        cq_zone: None,
        itu_zone: None,
        continent: None,
    };
    for item in overrides {
        match item {
            AliasOverride::CqZone(zone) => spec.cq_zone = Some(zone),
            AliasOverride::ItuZone(zone) => spec.itu_zone = Some(zone),
            AliasOverride::Continent(cont) => spec.continent = Some(cont),
            AliasOverride::Ignored => {}
        }
    }
    Ok((input, spec))
}

/// Parse the alias field of one row into override specs.
fn parse_aliases(field: &str) -> Vec<AliasSpec> {
    field
        .trim()
        .trim_end_matches(';')
        .split_whitespace()
        .filter_map(|token| match alias_token(token) {
            Ok((_, spec)) => Some(spec),
            Err(_) => {
                debug!("skipping unparseable prefix alias \"{token}\"");
                None
            }
        })
        .collect()
}
