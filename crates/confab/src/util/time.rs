//! Timestamp parsing and formatting.
//!
//! Wire formats disagree about timestamps: XMPP delayed delivery uses
//! `20060120T12:00:00`, newer stanzas use ISO-8601 with separators, and a
//! few legacy rosters carry `MM/DD/YYYY`. [`str_to_time`] accepts all three.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

/// A parsed timestamp: seconds since the epoch, the explicit UTC offset if
/// the input carried one, and the unconsumed tail of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTime<'a> {
    pub epoch: i64,
    pub offset: Option<UtcOffset>,
    pub rest: &'a str,
}

fn take_digits<'a>(s: &mut &'a str, max: usize) -> Option<&'a str> {
    let n = s
        .char_indices()
        .take(max)
        .take_while(|(_, c)| c.is_ascii_digit())
        .count();
    if n == 0 {
        return None;
    }
    let (digits, rest) = s.split_at(n);
    *s = rest;
    Some(digits)
}

fn eat(s: &mut &str, c: char) -> bool {
    if let Some(rest) = s.strip_prefix(c) {
        *s = rest;
        true
    } else {
        false
    }
}

/// Parse a timestamp in ISO-8601, compact XMPP (`YYYYMMDDTHH:MM:SS`), or
/// `MM/DD/YYYY` form. Times without an explicit offset are interpreted as
/// UTC. Returns `None` when no leading timestamp can be parsed at all.
pub fn str_to_time(input: &str) -> Option<ParsedTime<'_>> {
    let mut s = input.trim_start();

    let first = take_digits(&mut s, 8)?;

    let (year, month, day);
    if eat(&mut s, '/') {
        // MM/DD/YYYY
        month = first.parse::<u8>().ok()?;
        day = take_digits(&mut s, 2)?.parse::<u8>().ok()?;
        if !eat(&mut s, '/') {
            return None;
        }
        year = take_digits(&mut s, 4)?.parse::<i32>().ok()?;
    } else if first.len() == 8 {
        // Compact YYYYMMDD
        year = first[0..4].parse::<i32>().ok()?;
        month = first[4..6].parse::<u8>().ok()?;
        day = first[6..8].parse::<u8>().ok()?;
    } else if first.len() == 4 && eat(&mut s, '-') {
        // ISO YYYY-MM-DD
        year = first.parse::<i32>().ok()?;
        month = take_digits(&mut s, 2)?.parse::<u8>().ok()?;
        if !eat(&mut s, '-') {
            return None;
        }
        day = take_digits(&mut s, 2)?.parse::<u8>().ok()?;
    } else {
        return None;
    }

    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;

    let mut time = Time::MIDNIGHT;
    let mut offset = None;
    if eat(&mut s, 'T') || eat(&mut s, 't') || eat(&mut s, ' ') {
        let mut t = s;
        if let Some(parsed) = parse_time_part(&mut t) {
            time = parsed;
            offset = parse_offset(&mut t);
            s = t;
        }
    }

    let dt = PrimitiveDateTime::new(date, time);
    let epoch = dt.assume_offset(offset.unwrap_or(UtcOffset::UTC)).unix_timestamp();
    Some(ParsedTime { epoch, offset, rest: s })
}

fn parse_time_part(s: &mut &str) -> Option<Time> {
    let mut t = *s;
    let hour = take_digits(&mut t, 2)?.parse::<u8>().ok()?;
    if !eat(&mut t, ':') {
        return None;
    }
    let min = take_digits(&mut t, 2)?.parse::<u8>().ok()?;
    let sec = if eat(&mut t, ':') {
        take_digits(&mut t, 2)?.parse::<u8>().ok()?
    } else {
        0
    };
    // Fractional seconds are parsed and discarded.
    if eat(&mut t, '.') {
        let _ = take_digits(&mut t, 9);
    }
    let time = Time::from_hms(hour, min, sec).ok()?;
    *s = t;
    Some(time)
}

fn parse_offset(s: &mut &str) -> Option<UtcOffset> {
    let mut t = *s;
    if eat(&mut t, 'Z') || eat(&mut t, 'z') {
        *s = t;
        return Some(UtcOffset::UTC);
    }
    let sign = if eat(&mut t, '+') {
        1
    } else if eat(&mut t, '-') {
        -1
    } else {
        return None;
    };
    let hours = take_digits(&mut t, 2)?.parse::<i8>().ok()?;
    eat(&mut t, ':');
    let mins = take_digits(&mut t, 2).and_then(|d| d.parse::<i8>().ok()).unwrap_or(0);
    let off = UtcOffset::from_hms(sign * hours, sign * mins, 0).ok()?;
    *s = t;
    Some(off)
}

/// Build an epoch timestamp from calendar components, interpreted as UTC.
pub fn time_build(year: i32, month: u8, day: u8, hour: u8, min: u8, sec: u8) -> Option<i64> {
    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let time = Time::from_hms(hour, min, sec).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp())
}

const SHORT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const LONG: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const FULL: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
);

fn format_epoch(epoch: i64, fmt: &[FormatItem<'_>]) -> String {
    OffsetDateTime::from_unix_timestamp(epoch)
        .ok()
        .and_then(|dt| dt.format(fmt).ok())
        .unwrap_or_default()
}

/// `YYYY-MM-DD`.
pub fn date_format_short(epoch: i64) -> String {
    format_epoch(epoch, SHORT)
}

/// `YYYY-MM-DD HH:MM:SS`.
pub fn date_format_long(epoch: i64) -> String {
    format_epoch(epoch, LONG)
}

/// `YYYY-MM-DD HH:MM:SS +0000`.
pub fn date_format_full(epoch: i64) -> String {
    format_epoch(epoch, FULL)
}
