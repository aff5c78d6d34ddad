use std::collections::HashMap;

use chrono::{NaiveDateTime, NaiveTime, TimeZone, Utc};
use nom::{
    bytes::complete::take,
    character::complete::{char, digit1},
    combinator::{map_res, opt},
    sequence::preceded,
    IResult,
};

use crate::error::{Error, Result};
use crate::model::RawValue;

/// Epoch seconds for 2069-01-01. A numeric sample above this would land past
/// 2069 if read as seconds, so it is assumed to be milliseconds.
pub const BASE_SECONDS_2069: f64 = 3_124_224_000.0;

/// Epoch milliseconds for 2069-01-01. A numeric sample above this is assumed
/// to be microseconds.
pub const BASE_MICROS_2069: f64 = 3_124_224_000_000.0;

/// A stateless parsing strategy fixed once per field by classifying a single
/// sample value. Every later value of the field is parsed under the same
/// strategy; a value that no longer fits is a per-record ingest failure, not
/// a reclassification trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    /// Seconds since the Unix epoch, as-is.
    EpochSeconds,
    /// Milliseconds since the Unix epoch, divided by 1e3.
    EpochMillis,
    /// Microseconds since the Unix epoch, divided by 1e6.
    EpochMicros,
    /// Strict positional `YYYY-MM-DD HH:MM:SS[.ffffff]` layout, UTC.
    FixedLayout,
    /// `%Y-%m-%d %H:%M:%S` via the standard date parser, UTC.
    SimpleDateTime,
    /// Free-form date string, month-before-day, missing components filled
    /// with midnight UTC of the current day.
    FreeForm,
    /// Host-native timestamp value, UTC assumed.
    NativeDateTime,
    /// Host-native calendar date, midnight UTC implied.
    NativeDate,
}

impl ParserKind {
    /// The UTC offset control only applies to string-shaped strategies.
    /// Numeric epochs are self-describing and native values are already UTC,
    /// so hosts should disable the offset input for those.
    pub fn uses_utc_offset(&self) -> bool {
        matches!(
            self,
            ParserKind::FixedLayout | ParserKind::SimpleDateTime | ParserKind::FreeForm
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ParserKind::EpochSeconds | ParserKind::EpochMillis | ParserKind::EpochMicros
        )
    }
}

/// Classify a sample value into the parsing strategy for its field.
///
/// Deterministic: the same sample always yields the same kind. Returns
/// `Error::NoSample` for null/empty samples and `Error::UnparsableSample`
/// when nothing matches; in both cases the field cannot be used for time.
pub fn classify(sample: &RawValue) -> Result<ParserKind> {
    match sample {
        RawValue::Null => Err(Error::NoSample),
        RawValue::Text(s) if s.is_empty() => Err(Error::NoSample),
        RawValue::Number(n) => Ok(classify_numeric(*n)),
        RawValue::Text(s) => {
            // A numeric string is treated exactly like a number.
            if let Ok(n) = s.trim().parse::<f64>() {
                return Ok(classify_numeric(n));
            }
            if parse_fixed_layout(s).is_ok() {
                Ok(ParserKind::FixedLayout)
            } else if NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok() {
                Ok(ParserKind::SimpleDateTime)
            } else if parse_free_form(s).is_ok() {
                Ok(ParserKind::FreeForm)
            } else {
                Err(Error::UnparsableSample(s.clone()))
            }
        }
        RawValue::DateTime(_) => Ok(ParserKind::NativeDateTime),
        RawValue::Date(_) => Ok(ParserKind::NativeDate),
    }
}

fn classify_numeric(value: f64) -> ParserKind {
    if value > BASE_MICROS_2069 {
        ParserKind::EpochMicros
    } else if value > BASE_SECONDS_2069 {
        ParserKind::EpochMillis
    } else {
        ParserKind::EpochSeconds
    }
}

/// Parse a raw value to epoch seconds under a previously fixed strategy.
///
/// `utc_offset_secs` is added to the result for string-shaped strategies
/// only; see [`ParserKind::uses_utc_offset`].
pub fn parse(kind: ParserKind, value: &RawValue, utc_offset_secs: f64) -> Result<f64> {
    let secs = match kind {
        ParserKind::EpochSeconds => numeric_value(value)?,
        ParserKind::EpochMillis => numeric_value(value)? / 1e3,
        ParserKind::EpochMicros => numeric_value(value)? / 1e6,
        ParserKind::FixedLayout => parse_fixed_layout(text_value(value)?)?,
        ParserKind::SimpleDateTime => {
            let s = text_value(value)?;
            let dt = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map_err(|e| bad_timestamp(s, e.to_string()))?;
            dt.and_utc().timestamp() as f64
        }
        ParserKind::FreeForm => parse_free_form(text_value(value)?)?,
        ParserKind::NativeDateTime => match value {
            RawValue::DateTime(dt) => dt.and_utc().timestamp_micros() as f64 / 1e6,
            other => return Err(bad_timestamp_value(other, "expected a datetime value")),
        },
        ParserKind::NativeDate => match value {
            RawValue::Date(d) => d.and_time(NaiveTime::MIN).and_utc().timestamp() as f64,
            other => return Err(bad_timestamp_value(other, "expected a date value")),
        },
    };

    if kind.uses_utc_offset() {
        Ok(secs + utc_offset_secs)
    } else {
        Ok(secs)
    }
}

// --- VALUE ACCESS ---

fn numeric_value(value: &RawValue) -> Result<f64> {
    match value {
        RawValue::Number(n) => Ok(*n),
        RawValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| bad_timestamp(s, e.to_string())),
        other => Err(bad_timestamp_value(other, "expected a numeric value")),
    }
}

fn text_value(value: &RawValue) -> Result<&str> {
    match value {
        RawValue::Text(s) => Ok(s),
        other => Err(bad_timestamp_value(other, "expected a text value")),
    }
}

fn bad_timestamp(value: &str, reason: String) -> Error {
    Error::BadTimestamp { value: value.to_string(), reason }
}

fn bad_timestamp_value(value: &RawValue, reason: &str) -> Error {
    Error::BadTimestamp { value: format!("{:?}", value), reason: reason.to_string() }
}

// --- FIXED POSITIONAL LAYOUT ---

fn fixed_number(count: usize) -> impl FnMut(&str) -> IResult<&str, u32> {
    move |input| map_res(take(count), |s: &str| s.parse::<u32>())(input)
}

fn parse_fixed_fields(input: &str) -> IResult<&str, (i32, u32, u32, u32, u32, u32, Option<&str>)> {
    let (input, year) = map_res(take(4usize), |s: &str| s.parse::<i32>())(input)?;
    let (input, _) = char('-')(input)?;
    let (input, month) = fixed_number(2)(input)?;
    let (input, _) = char('-')(input)?;
    let (input, day) = fixed_number(2)(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, hour) = fixed_number(2)(input)?;
    let (input, _) = char(':')(input)?;
    let (input, minute) = fixed_number(2)(input)?;
    let (input, _) = char(':')(input)?;
    let (input, second) = fixed_number(2)(input)?;
    let (input, frac) = opt(preceded(char('.'), digit1))(input)?;
    Ok((input, (year, month, day, hour, minute, second, frac)))
}

fn parse_fixed_layout(input: &str) -> Result<f64> {
    let (rest, (year, month, day, hour, minute, second, frac)) = parse_fixed_fields(input)
        .map_err(|_| bad_timestamp(input, "not a fixed-layout timestamp".to_string()))?;
    if !rest.is_empty() {
        return Err(bad_timestamp(input, format!("trailing input {:?}", rest)));
    }

    let date = chrono::NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| bad_timestamp(input, "calendar date out of range".to_string()))?;
    let dt = date
        .and_hms_opt(hour, minute, second)
        .ok_or_else(|| bad_timestamp(input, "time of day out of range".to_string()))?;

    // Fraction digits scale by their own length: ".5" is half a second.
    let frac_secs = match frac {
        Some(digits) => {
            let digits = &digits[..digits.len().min(9)];
            let n: u64 = digits
                .parse()
                .map_err(|_| bad_timestamp(input, "bad fractional seconds".to_string()))?;
            n as f64 / 10f64.powi(digits.len() as i32)
        }
        None => 0.0,
    };

    Ok(dt.and_utc().timestamp() as f64 + frac_secs)
}

// --- FREE-FORM STRINGS ---

fn parse_free_form(s: &str) -> Result<f64> {
    // Unspecified components are filled from midnight UTC of the current
    // day, mirroring the behavior users see in spreadsheet-style tools.
    let default = Utc::now().date_naive().and_time(NaiveTime::MIN);
    let mut parser = dtparse::Parser::default();
    let (dt, offset, _) = parser
        .parse(
            s,
            Some(false), // month before day
            None,
            false,
            false,
            Some(&default),
            false,
            &HashMap::new(),
        )
        .map_err(|e| bad_timestamp(s, format!("{:?}", e)))?;

    let micros = match offset {
        Some(off) => off
            .from_local_datetime(&dt)
            .single()
            .ok_or_else(|| bad_timestamp(s, "ambiguous local time".to_string()))?
            .timestamp_micros(),
        None => dt.and_utc().timestamp_micros(),
    };
    Ok(micros as f64 / 1e6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn num(v: f64) -> RawValue {
        RawValue::Number(v)
    }

    fn text(s: &str) -> RawValue {
        RawValue::Text(s.to_string())
    }

    #[test]
    fn classify_epoch_seconds() {
        let sample = num(1_700_000_000.0);
        assert_eq!(classify(&sample).unwrap(), ParserKind::EpochSeconds);
        let secs = parse(ParserKind::EpochSeconds, &sample, 0.0).unwrap();
        assert_eq!(secs, 1_700_000_000.0);
    }

    #[test]
    fn classify_epoch_millis() {
        let sample = num(1_700_000_000_000.0);
        assert_eq!(classify(&sample).unwrap(), ParserKind::EpochMillis);
        let secs = parse(ParserKind::EpochMillis, &sample, 0.0).unwrap();
        assert_eq!(secs, 1_700_000_000.0);
    }

    #[test]
    fn classify_epoch_micros() {
        let sample = num(1_700_000_000_000_000.0);
        assert_eq!(classify(&sample).unwrap(), ParserKind::EpochMicros);
        let secs = parse(ParserKind::EpochMicros, &sample, 0.0).unwrap();
        assert_eq!(secs, 1_700_000_000.0);
    }

    #[test]
    fn numeric_strings_classify_like_numbers() {
        assert_eq!(classify(&text("1700000000")).unwrap(), ParserKind::EpochSeconds);
        assert_eq!(
            classify(&text("1700000000000")).unwrap(),
            ParserKind::EpochMillis
        );
    }

    #[test]
    fn fixed_layout_with_fraction() {
        let sample = text("2021-06-01 12:00:00.500000");
        assert_eq!(classify(&sample).unwrap(), ParserKind::FixedLayout);
        let secs = parse(ParserKind::FixedLayout, &sample, 0.0).unwrap();
        assert_eq!(secs, 1_622_548_800.5);
    }

    #[test]
    fn fixed_layout_short_fraction_scales() {
        let secs = parse(ParserKind::FixedLayout, &text("2021-06-01 12:00:00.5"), 0.0).unwrap();
        assert_eq!(secs, 1_622_548_800.5);
    }

    #[test]
    fn fixed_layout_without_fraction() {
        let sample = text("2021-06-01 00:00:00");
        assert_eq!(classify(&sample).unwrap(), ParserKind::FixedLayout);
        let secs = parse(ParserKind::FixedLayout, &sample, 0.0).unwrap();
        assert_eq!(secs, 1_622_505_600.0);
    }

    #[test]
    fn simple_datetime_catches_unpadded_fields() {
        // Misaligned for the positional layout, fine for the format parser.
        let sample = text("2021-6-1 12:00:00");
        assert_eq!(classify(&sample).unwrap(), ParserKind::SimpleDateTime);
        let secs = parse(ParserKind::SimpleDateTime, &sample, 0.0).unwrap();
        assert_eq!(secs, 1_622_548_800.0);
    }

    #[test]
    fn free_form_parses_month_names() {
        let sample = text("June 1 2021");
        assert_eq!(classify(&sample).unwrap(), ParserKind::FreeForm);
        let secs = parse(ParserKind::FreeForm, &sample, 0.0).unwrap();
        assert_eq!(secs, 1_622_505_600.0);
    }

    #[test]
    fn offset_applies_to_string_kinds_only() {
        let fixed = text("2021-06-01 00:00:00");
        let secs = parse(ParserKind::FixedLayout, &fixed, -3600.0).unwrap();
        assert_eq!(secs, 1_622_505_600.0 - 3600.0);

        let epoch = num(1_700_000_000.0);
        let secs = parse(ParserKind::EpochSeconds, &epoch, -3600.0).unwrap();
        assert_eq!(secs, 1_700_000_000.0);
    }

    #[test]
    fn native_values_are_utc() {
        let date = NaiveDate::from_ymd_opt(2021, 6, 1).unwrap();
        let sample = RawValue::Date(date);
        assert_eq!(classify(&sample).unwrap(), ParserKind::NativeDate);
        assert_eq!(parse(ParserKind::NativeDate, &sample, 0.0).unwrap(), 1_622_505_600.0);

        let dt = RawValue::DateTime(date.and_hms_opt(12, 0, 0).unwrap());
        assert_eq!(classify(&dt).unwrap(), ParserKind::NativeDateTime);
        assert_eq!(
            parse(ParserKind::NativeDateTime, &dt, 7200.0).unwrap(),
            1_622_548_800.0
        );
    }

    #[test]
    fn null_and_empty_have_no_sample() {
        assert!(matches!(classify(&RawValue::Null), Err(Error::NoSample)));
        assert!(matches!(classify(&text("")), Err(Error::NoSample)));
    }

    #[test]
    fn garbage_is_unparsable() {
        assert!(matches!(
            classify(&text("not a time at all ||")),
            Err(Error::UnparsableSample(_))
        ));
    }

    #[test]
    fn classification_is_deterministic() {
        let sample = text("2021-06-01 12:00:00.500000");
        let first = classify(&sample).unwrap();
        for _ in 0..10 {
            assert_eq!(classify(&sample).unwrap(), first);
        }
    }

    #[test]
    fn ingest_time_mismatch_is_an_error() {
        // Field classified as fixed layout, later value does not fit.
        let err = parse(ParserKind::FixedLayout, &text("June 1 2021"), 0.0);
        assert!(matches!(err, Err(Error::BadTimestamp { .. })));
    }
}
