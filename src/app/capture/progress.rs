use std::sync::OnceLock;

use regex::Regex;

/// One line of `screenrecord --verbose` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordProgress {
    Display { width: u32, height: u32 },
    Configuring { width: u32, height: u32 },
    Stopped { frames: u64, seconds: u64 },
    TimeLimitReached,
    Error { reason: String },
    Other { raw: String },
}

fn dimensions_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)x(\d+)").expect("dimensions regex"))
}

fn stopped_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"recorded (\d+) frames in (\d+) second").expect("encoder stopped regex")
    })
}

fn dimensions(text: &str) -> Option<(u32, u32)> {
    let caps = dimensions_re().captures(text)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

pub fn parse_record_line(line: &str) -> RecordProgress {
    let raw = line.trim();
    let other = || RecordProgress::Other {
        raw: raw.to_string(),
    };

    if let Some(rest) = raw.strip_prefix("ERROR") {
        let reason = rest.trim_start_matches(':').trim();
        return RecordProgress::Error {
            reason: if reason.is_empty() { raw.to_string() } else { reason.to_string() },
        };
    }
    if raw.starts_with("Main display is") {
        return match dimensions(raw) {
            Some((width, height)) => RecordProgress::Display { width, height },
            None => other(),
        };
    }
    if raw.starts_with("Configuring recorder") {
        return match dimensions(raw) {
            Some((width, height)) => RecordProgress::Configuring { width, height },
            None => other(),
        };
    }
    if raw.starts_with("Encoder stopping") {
        if let Some(caps) = stopped_re().captures(raw) {
            let frames = caps[1].parse().unwrap_or(0);
            let seconds = caps[2].parse().unwrap_or(0);
            return RecordProgress::Stopped { frames, seconds };
        }
        return other();
    }
    if raw.eq_ignore_ascii_case("time limit reached") {
        return RecordProgress::TimeLimitReached;
    }
    other()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_display_and_configuration() {
        assert_eq!(
            parse_record_line("Main display is 1080x2400 @60.00fps (orientation=ROTATION_0)"),
            RecordProgress::Display {
                width: 1080,
                height: 2400
            }
        );
        assert_eq!(
            parse_record_line("Configuring recorder for 720x1280 video/avc at 4.00Mbps"),
            RecordProgress::Configuring {
                width: 720,
                height: 1280
            }
        );
    }

    #[test]
    fn parses_encoder_summary() {
        assert_eq!(
            parse_record_line("Encoder stopping; recorded 123 frames in 4 seconds"),
            RecordProgress::Stopped {
                frames: 123,
                seconds: 4
            }
        );
        assert_eq!(parse_record_line("Time limit reached"), RecordProgress::TimeLimitReached);
    }

    #[test]
    fn parses_errors_and_unknown_lines() {
        assert_eq!(
            parse_record_line("ERROR: unable to configure video/avc codec at 4096x4096 (err=-38)"),
            RecordProgress::Error {
                reason: "unable to configure video/avc codec at 4096x4096 (err=-38)".to_string()
            }
        );
        assert_eq!(
            parse_record_line("Content area is 1080x2400 at offset x=0 y=0"),
            RecordProgress::Other {
                raw: "Content area is 1080x2400 at offset x=0 y=0".to_string()
            }
        );
    }
}
