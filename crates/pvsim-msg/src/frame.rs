//! ---
//! pvsim_section: "02-messaging"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Frame codec and broker transports."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use crate::FrameError;

const TAG_SEPARATOR: &str = "::";

/// One protocol message.
///
/// ```text
/// START::<unix_timestamp>
/// DATA::<day>D<iteration>D<meter_value>
/// END::<day>D<iteration>D<sentinel>
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Opens a day; carries the emitter's wall-clock time.
    Start {
        /// Unix timestamp in seconds.
        timestamp: i64,
    },
    /// One meter reading.
    Data {
        /// Simulated day counter.
        day: u64,
        /// 1-based iteration within the day.
        iteration: u32,
        /// Meter reading in watts.
        value: i64,
    },
    /// Closes a day.
    End {
        /// Day being closed.
        day: u64,
        /// Last iteration emitted.
        iteration: u32,
        /// Always `0` from the emitter; ignored by the consumer.
        sentinel: i64,
    },
}

impl Frame {
    /// Wire tag for `Start`.
    pub const START: &'static str = "START";
    /// Wire tag for `Data`.
    pub const DATA: &'static str = "DATA";
    /// Wire tag for `End`.
    pub const END: &'static str = "END";

    /// Wire tag of this frame.
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Start { .. } => Self::START,
            Frame::Data { .. } => Self::DATA,
            Frame::End { .. } => Self::END,
        }
    }

    /// Day carried by `Data` and `End`.
    pub fn day(&self) -> Option<u64> {
        match self {
            Frame::Start { .. } => None,
            Frame::Data { day, .. } | Frame::End { day, .. } => Some(*day),
        }
    }

    /// Render the frame with the given field delimiter.
    pub fn encode(&self, delimiter: char) -> String {
        match self {
            Frame::Start { timestamp } => format!("{}{}{}", Self::START, TAG_SEPARATOR, timestamp),
            Frame::Data {
                day,
                iteration,
                value,
            } => format!(
                "{}{}{}{d}{}{d}{}",
                Self::DATA,
                TAG_SEPARATOR,
                day,
                iteration,
                value,
                d = delimiter
            ),
            Frame::End {
                day,
                iteration,
                sentinel,
            } => format!(
                "{}{}{}{d}{}{d}{}",
                Self::END,
                TAG_SEPARATOR,
                day,
                iteration,
                sentinel,
                d = delimiter
            ),
        }
    }

    /// Parse a frame. Fields must be canonical decimal integers: no sign
    /// other than a leading `-`, no leading zeros and no whitespace.
    pub fn decode(input: &str, delimiter: char) -> Result<Frame, FrameError> {
        let malformed = |reason| FrameError::Malformed {
            input: input.to_owned(),
            reason,
        };
        let (tag, payload) = input
            .split_once(TAG_SEPARATOR)
            .ok_or_else(|| malformed("missing `::` separator"))?;

        match tag {
            Self::START => {
                let timestamp = parse_field(payload).ok_or_else(|| malformed("bad timestamp"))?;
                Ok(Frame::Start { timestamp })
            }
            Self::DATA | Self::END => {
                let mut fields = payload.split(delimiter);
                let (Some(day), Some(iteration), Some(value), None) =
                    (fields.next(), fields.next(), fields.next(), fields.next())
                else {
                    return Err(malformed("expected exactly three fields"));
                };
                let day = parse_field(day).ok_or_else(|| malformed("bad day"))?;
                let iteration = parse_field(iteration).ok_or_else(|| malformed("bad iteration"))?;
                let value = parse_field(value).ok_or_else(|| malformed("bad value"))?;
                if tag == Self::DATA {
                    Ok(Frame::Data {
                        day,
                        iteration,
                        value,
                    })
                } else {
                    Ok(Frame::End {
                        day,
                        iteration,
                        sentinel: value,
                    })
                }
            }
            other if !other.is_empty() && other.bytes().all(|b| b.is_ascii_uppercase()) => {
                Err(FrameError::UnknownTag(other.to_owned()))
            }
            _ => Err(malformed("bad tag")),
        }
    }

    /// Parse a frame from raw delivery bytes.
    pub fn decode_bytes(bytes: &[u8], delimiter: char) -> Result<Frame, FrameError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FrameError::Malformed {
            input: String::from_utf8_lossy(bytes).into_owned(),
            reason: "not valid utf-8",
        })?;
        Self::decode(text, delimiter)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode(';'))
    }
}

fn parse_field<T: FromStr>(field: &str) -> Option<T> {
    let digits = field.strip_prefix('-').unwrap_or(field);
    let canonical = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
        && field != "-0";
    if !canonical {
        return None;
    }
    field.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_exact_grammar() {
        assert_eq!(Frame::Start { timestamp: 1_700_000_000 }.encode(';'), "START::1700000000");
        assert_eq!(
            Frame::Data {
                day: 0,
                iteration: 1,
                value: 6750
            }
            .encode(';'),
            "DATA::0;1;6750"
        );
        assert_eq!(
            Frame::End {
                day: 3,
                iteration: 1440,
                sentinel: 0
            }
            .encode(','),
            "END::3,1440,0"
        );
    }

    #[test]
    fn tag_and_day_accessors() {
        let start = Frame::Start { timestamp: 5 };
        let end = Frame::End {
            day: 2,
            iteration: 24,
            sentinel: 0,
        };
        assert_eq!((start.tag(), start.day()), (Frame::START, None));
        assert_eq!((end.tag(), end.day()), (Frame::END, Some(2)));
        assert!(end.encode(';').starts_with(end.tag()));
    }

    #[test]
    fn decodes_frames() {
        assert_eq!(
            Frame::decode("DATA::2;17;-5", ';').unwrap(),
            Frame::Data {
                day: 2,
                iteration: 17,
                value: -5
            }
        );
        assert_eq!(
            Frame::decode_bytes(b"START::12", ';').unwrap(),
            Frame::Start { timestamp: 12 }
        );
    }

    #[test]
    fn rejects_wrong_field_count() {
        for input in ["DATA::1;2", "DATA::1;2;3;4", "END::", "DATA::1;2;"] {
            assert!(
                matches!(Frame::decode(input, ';'), Err(FrameError::Malformed { .. })),
                "{input} accepted"
            );
        }
    }

    #[test]
    fn rejects_non_canonical_numbers() {
        for input in [
            "DATA::01;2;3",
            "DATA::1;+2;3",
            "DATA:: 1;2;3",
            "DATA::1;2;3 ",
            "DATA::-1;2;3",
            "DATA::1;2;-0",
            "START::abc",
            "START::",
            "DATA::1;99999999999;3",
        ] {
            assert!(
                matches!(Frame::decode(input, ';'), Err(FrameError::Malformed { .. })),
                "{input} accepted"
            );
        }
    }

    #[test]
    fn wrong_delimiter_is_malformed() {
        assert!(Frame::decode("DATA::1,2,3", ';').is_err());
        assert!(Frame::decode("DATA::1,2,3", ',').is_ok());
    }

    #[test]
    fn unknown_tags_are_distinguished() {
        assert_eq!(
            Frame::decode("PAUSE::1", ';'),
            Err(FrameError::UnknownTag("PAUSE".into()))
        );
        assert!(matches!(
            Frame::decode("4200", ';'),
            Err(FrameError::Malformed { .. })
        ));
        assert!(matches!(
            Frame::decode("data::1;2;3", ';'),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        assert!(matches!(
            Frame::decode_bytes(&[0x44, 0xff, 0x3a], ';'),
            Err(FrameError::Malformed { .. })
        ));
    }
}
