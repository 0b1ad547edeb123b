//! Parsers for DX cluster protocol lines.
//!
//! This module uses the `nom` parsing library to parse the heterogeneous
//! line stream coming from cluster servers: propagation spots, WWV
//! solar-index announcements, and operator broadcasts. The parser is
//! designed with correctness as the primary goal, followed by performance.
//!
//! # Spot format
//!
//! ```text
//! DX de SPOTTER:  FREQ  CALLSIGN  MESSAGE...  TIMEZ
//! ```
//!
//! Example:
//! ```text
//! DX de SP5NOF:   10136.0  UI5A     FT8 +13dB from KO85 1778Hz   2138Z
//! ```
//!
//! # WWV format
//!
//! ```text
//! WWV de W0MU <18Z>: SFI=93, A=4, K=2, No Storms -> No Storms
//! ```

use chrono::Utc;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag_no_case, take_until, take_while1},
    character::complete::{char, digit0, digit1, multispace1, one_of, space0, space1},
    combinator::{map_res, opt, recognize, value},
    sequence::{preceded, separated_pair, terminated},
};
use thiserror::Error;

use crate::dxcc::{DxccEntity, DxccResolver};
use crate::record::{Mode, SpotRecord, WwvRecord, band_for_frequency};

/// Errors that can occur during line parsing.
///
/// All of these are transient: the offending line is logged and skipped,
/// never allowed to end the session.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed spot line: {0}")]
    MalformedSpot(String),

    #[error("malformed WWV line: {0}")]
    MalformedWwv(String),

    #[error("spot line has no trailing timestamp token")]
    MissingTimestamp,

    #[error("no DXCC allocation for callsign \"{0}\"")]
    UnresolvedCallsign(String),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Classification of one raw protocol line by its leading pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// `DX de ...` propagation spot.
    Spot,
    /// `WWV de ...` solar-index announcement.
    Wwv,
    /// `To ALL ...` operator broadcast; logged, never stored.
    Broadcast,
    /// Anything else (prompts, banners, chatter).
    Other,
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Classify a raw line by its leading pattern.
pub fn classify(line: &str) -> LineClass {
    let line = line.trim_start();
    if starts_with_ignore_case(line, "DX de ") {
        LineClass::Spot
    } else if starts_with_ignore_case(line, "WWV de ") {
        LineClass::Wwv
    } else if starts_with_ignore_case(line, "To ALL") {
        LineClass::Broadcast
    } else {
        LineClass::Other
    }
}

/// Check if a character is valid in a callsign.
///
/// Valid callsign characters are alphanumeric plus `/` for portable
/// designators and `-`/`#` for suffixes like the `-#` skimmer marker.
fn is_callsign_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '/' || c == '-' || c == '#'
}

/// Parse the "DX de " prefix that starts every spot line.
fn parse_dx_de_prefix(input: &str) -> IResult<&str, ()> {
    value(
        (),
        (
            tag_no_case("DX"),
            multispace1,
            tag_no_case("de"),
            multispace1,
        ),
    )
    .parse(input)
}

/// Parse a callsign token.
fn parse_callsign(input: &str) -> IResult<&str, &str> {
    take_while1(is_callsign_char).parse(input)
}

/// Parse the reporting callsign followed by a colon.
fn parse_spotter(input: &str) -> IResult<&str, &str> {
    terminated(parse_callsign, (space0, char(':'), space0)).parse(input)
}

/// Parse a floating-point frequency in kHz.
fn parse_frequency(input: &str) -> IResult<&str, f64> {
    map_res(recognize((digit1, opt((char('.'), digit1)))), |s: &str| {
        s.parse::<f64>()
    })
    .parse(input)
}

/// Parse one of the known mode tokens.
fn parse_mode_token(input: &str) -> IResult<&str, Mode> {
    alt((
        value(Mode::Ft8, tag_no_case("FT8")),
        value(Mode::Ft4, tag_no_case("FT4")),
        value(Mode::Rtty, tag_no_case("RTTY")),
        value(Mode::Cw, tag_no_case("CW")),
        value(Mode::Psk, (tag_no_case("PSK"), digit0)),
    ))
    .parse(input)
}

/// Parse a signed signal report with an optional dB/WPM unit.
fn parse_signal_value(input: &str) -> IResult<&str, i32> {
    terminated(
        map_res(recognize((opt(one_of("+-")), digit1)), |s: &str| {
            s.parse::<i32>()
        }),
        opt((space0, alt((tag_no_case("dB"), tag_no_case("WPM"))))),
    )
    .parse(input)
}

/// Parse a mode token followed by its signal report.
fn parse_mode_report(input: &str) -> IResult<&str, (Mode, i32)> {
    separated_pair(parse_mode_token, space1, parse_signal_value).parse(input)
}

/// Byte offsets of every whitespace-separated token start.
fn token_starts<'a>(s: &'a str) -> impl Iterator<Item = usize> + 'a {
    s.split_whitespace()
        .map(move |token| token.as_ptr() as usize - s.as_ptr() as usize)
}

/// Extract the mode and signal report from a spot message.
///
/// A message without the mode-plus-report pattern is a voice spot by
/// convention: mode SSB, no signal value.
pub(crate) fn extract_mode_signal(message: &str) -> (Mode, Option<i32>) {
    for start in token_starts(message) {
        if let Ok((_, (mode, signal))) = parse_mode_report(&message[start..]) {
            return (mode, Some(signal));
        }
    }
    (Mode::Ssb, None)
}

/// A token shaped like the trailing `HHMMZ` timestamp.
fn is_time_token(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 5
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && matches!(bytes[4], b'Z' | b'z')
}

/// Split the tail of a spot line at its last `HHMMZ` token.
///
/// Returns the message text before the token. The wall-clock token itself is
/// only a delimiter; capture timestamps are assigned at parse time.
fn split_trailing_time(rest: &str) -> Option<&str> {
    let mut cut = None;
    for start in token_starts(rest) {
        let token = rest[start..].split_whitespace().next().unwrap_or("");
        if is_time_token(token) {
            cut = Some(start);
        }
    }
    cut.map(|start| rest[..start].trim_end())
}

/// Strip the cluster-protocol skimmer marker from a reporting callsign.
fn strip_skimmer_suffix(call: &str) -> &str {
    call.strip_suffix("-#").unwrap_or(call)
}

/// Parse the fixed header of a spot line: reporter and frequency.
fn spot_header(input: &str) -> IResult<&str, (&str, f64)> {
    let (input, _) = parse_dx_de_prefix(input)?;
    let (input, spotter) = parse_spotter(input)?;
    let (input, _) = space0(input)?;
    let (input, frequency) = parse_frequency(input)?;
    let (input, _) = space1(input)?;
    Ok((input, (spotter, frequency)))
}

/// Converts raw protocol lines into records, resolving callsigns through the
/// DXCC prefix database handed in at construction.
pub struct LineParser {
    dxcc: DxccResolver,
}

impl LineParser {
    /// Create a parser over a loaded prefix database.
    pub fn new(dxcc: DxccResolver) -> Self {
        Self { dxcc }
    }

    /// Access the underlying resolver.
    pub fn dxcc(&self) -> &DxccResolver {
        &self.dxcc
    }

    /// Parse a complete spot line into a [`SpotRecord`].
    ///
    /// Rejects the line when the frequency is malformed, the trailing
    /// timestamp token is missing, or either callsign fails resolution.
    pub fn parse_spot(&self, line: &str) -> ParseResult<SpotRecord> {
        let line = line.trim();
        let (rest, (de_raw, frequency)) =
            spot_header(line).map_err(|_| ParseError::MalformedSpot(line.to_string()))?;

        let (rest, dx_raw) = terminated(parse_callsign, space0)
            .parse(rest)
            .map_err(|_| ParseError::MalformedSpot(line.to_string()))?;

        let message = split_trailing_time(rest).ok_or(ParseError::MissingTimestamp)?;

        let de = strip_skimmer_suffix(de_raw);
        let de_entity = self
            .dxcc
            .lookup(de)
            .map_err(|_| ParseError::UnresolvedCallsign(de.to_string()))?;
        let dx_entity = self.resolve_dx(dx_raw)?;

        let (mode, signal_db) = extract_mode_signal(message);

        Ok(SpotRecord {
            de: de.to_string(),
            frequency_khz: frequency,
            dx: dx_raw.to_string(),
            message: message.to_string(),
            cont_de: de_entity.continent.clone(),
            cont_dx: dx_entity.continent.clone(),
            cq_de: de_entity.cq_zone,
            itu_de: de_entity.itu_zone,
            cq_dx: dx_entity.cq_zone,
            itu_dx: dx_entity.itu_zone,
            mode,
            signal_db,
            band: band_for_frequency(frequency),
            time: Utc::now(),
        })
    }

    /// Parse a WWV announcement line into a [`WwvRecord`].
    pub fn parse_wwv(&self, line: &str) -> ParseResult<WwvRecord> {
        parse_wwv(line)
    }

    /// Resolve the reported callsign, falling back to the portion before a
    /// `/` portable designator. The first successful lookup wins.
    fn resolve_dx(&self, dx: &str) -> ParseResult<&DxccEntity> {
        if let Ok(entity) = self.dxcc.lookup(dx) {
            return Ok(entity);
        }
        if let Some((stem, _)) = dx.split_once('/')
            && !stem.is_empty()
            && let Ok(entity) = self.dxcc.lookup(stem)
        {
            return Ok(entity);
        }
        Err(ParseError::UnresolvedCallsign(dx.to_string()))
    }
}

fn parse_u16(input: &str) -> IResult<&str, u16> {
    map_res(digit1, |s: &str| s.parse::<u16>()).parse(input)
}

fn wwv_body(input: &str) -> IResult<&str, (u16, u16, u16, &str)> {
    let (input, _) = (
        tag_no_case("WWV"),
        multispace1,
        tag_no_case("de"),
        multispace1,
    )
        .parse(input)?;
    let (input, _station) = parse_callsign(input)?;
    let (input, _) = take_until("SFI=").parse(input)?;
    let (input, sfi) = preceded(tag_no_case("SFI="), parse_u16).parse(input)?;
    let (input, _) = (char(','), space0).parse(input)?;
    let (input, a_index) = preceded(tag_no_case("A="), parse_u16).parse(input)?;
    let (input, _) = (char(','), space0).parse(input)?;
    let (input, k_index) = preceded(tag_no_case("K="), parse_u16).parse(input)?;
    let (input, _) = opt((char(','), space0)).parse(input)?;
    Ok(("", (sfi, a_index, k_index, input.trim())))
}

/// Parse a WWV announcement line into a [`WwvRecord`].
///
/// # Example
///
/// ```
/// use dxcluster::parser::parse_wwv;
///
/// let line = "WWV de W0MU <18Z>: SFI=93, A=4, K=2, No Storms -> No Storms";
/// let wwv = parse_wwv(line).unwrap();
/// assert_eq!(wwv.sfi, 93);
/// assert_eq!(wwv.a_index, 4);
/// assert_eq!(wwv.k_index, 2);
/// assert_eq!(wwv.conditions, "No Storms -> No Storms");
/// ```
pub fn parse_wwv(line: &str) -> ParseResult<WwvRecord> {
    let line = line.trim();
    let (_, (sfi, a_index, k_index, conditions)) =
        wwv_body(line).map_err(|_| ParseError::MalformedWwv(line.to_string()))?;
    Ok(WwvRecord {
        sfi,
        a_index,
        k_index,
        conditions: conditions.to_string(),
        time: Utc::now(),
    })
}
