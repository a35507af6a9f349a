//! Block and key/value extraction for indented device dumps such as
//! `dumpsys package`. Nothing here fails: unexpected lines degrade to
//! diagnostic `Failed` pairs.

use regex::Regex;

use crate::app::models::KeyValue;

pub const FAILED_KEY: &str = "Failed";

/// Half-open line range `[start, end)` of a block, including its header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextBlock {
    pub start: usize,
    pub end: usize,
    pub indent: usize,
}

impl TextBlock {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lines<'a, S: AsRef<str>>(&self, lines: &'a [S]) -> &'a [S] {
        &lines[self.start..self.end]
    }
}

pub fn indentation(line: &str) -> usize {
    line.chars().take_while(|ch| ch.is_whitespace()).count()
}

/// Locates the first block at or after `from` whose header starts with
/// `marker` (after trimming). The block runs until a blank line or until the
/// indentation drops back to the header's level. Flat dumps, where the body
/// shares the header's indentation, only end on a blank line or a shallower
/// line.
pub fn find_block<S: AsRef<str>>(lines: &[S], marker: &str, from: usize) -> Option<TextBlock> {
    let start = (from..lines.len()).find(|&index| lines[index].as_ref().trim().starts_with(marker))?;
    let header_indent = indentation(lines[start].as_ref());

    let mut body_indent = None;
    let mut end = start + 1;
    while end < lines.len() {
        let line = lines[end].as_ref();
        if line.trim().is_empty() {
            break;
        }
        let indent = indentation(line);
        let body = *body_indent.get_or_insert(indent);
        let nested = body > header_indent;
        if indent < header_indent || (nested && indent <= header_indent) {
            break;
        }
        end += 1;
    }

    Some(TextBlock {
        start,
        end,
        indent: header_indent,
    })
}

/// Header plus body of the first block starting with `marker`; empty when the
/// marker is missing or the header has no body.
pub fn get_block<'a, S: AsRef<str>>(lines: &'a [S], marker: &str) -> &'a [S] {
    match find_block(lines, marker, 0) {
        Some(block) if block.len() > 1 => block.lines(lines),
        _ => &lines[0..0],
    }
}

/// Every block whose header starts with `marker`, in order.
pub fn blocks_with_prefix<S: AsRef<str>>(lines: &[S], marker: &str) -> Vec<TextBlock> {
    let mut blocks = Vec::new();
    let mut from = 0;
    while let Some(block) = find_block(lines, marker, from) {
        from = block.end.max(block.start + 1);
        blocks.push(block);
    }
    blocks
}

/// Turns block lines into ordered pairs:
/// - `key=value` (several space separated pairs on one line are split, a
///   leading `label: ` is kept on each key);
/// - a line ending in `permissions:` collects its more-indented member lines,
///   joined with `", "`, under the header text;
/// - anything else is kept as a `Failed` pair holding the line.
pub fn parse_key_values<S: AsRef<str>>(lines: &[S]) -> Vec<KeyValue> {
    let mut pairs = Vec::new();
    let mut index = 0;
    while index < lines.len() {
        let line = lines[index].as_ref();
        let trimmed = line.trim();
        index += 1;
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.ends_with("permissions:") {
            let header_indent = indentation(line);
            let mut members = Vec::new();
            while index < lines.len() {
                let member = lines[index].as_ref();
                if member.trim().is_empty() || indentation(member) <= header_indent {
                    break;
                }
                members.push(member.trim());
                index += 1;
            }
            pairs.push(KeyValue::new(trimmed, members.join(", ")));
            continue;
        }

        match split_pairs(trimmed) {
            Some(mut found) => pairs.append(&mut found),
            None => pairs.push(KeyValue::new(FAILED_KEY, trimmed)),
        }
    }
    pairs
}

fn split_pairs(trimmed: &str) -> Option<Vec<KeyValue>> {
    // `User 0: ceDataInode=1 installed=true` -> `User 0: ceDataInode`, `User 0: installed`
    if let Some((label, rest)) = trimmed.split_once(": ") {
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        if !label.contains('=') && !tokens.is_empty() && tokens.iter().all(|token| is_pair(token)) {
            return tokens
                .iter()
                .map(|token| {
                    token
                        .split_once('=')
                        .map(|(key, value)| KeyValue::new(format!("{label}: {key}"), value))
                })
                .collect();
        }
    }
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens.len() > 1 && tokens.iter().all(|token| is_pair(token)) {
        return tokens
            .iter()
            .map(|token| {
                token
                    .split_once('=')
                    .map(|(key, value)| KeyValue::new(key, value))
            })
            .collect();
    }
    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some(vec![KeyValue::new(key, value.trim())])
}

fn is_pair(token: &str) -> bool {
    matches!(token.split_once('='), Some((key, _)) if !key.is_empty())
}

/// Activity names listed as `<package>/<activity> filter` in an activity
/// resolver table, first occurrence order.
pub fn parse_activities<S: AsRef<str>>(lines: &[S], package: &str) -> Vec<String> {
    let pattern = format!(r"{}/(?P<activity>\S+)\s+filter", regex::escape(package));
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    let mut activities: Vec<String> = Vec::new();
    for line in lines {
        if let Some(caps) = re.captures(line.as_ref()) {
            let activity = caps["activity"].to_string();
            if !activities.contains(&activity) {
                activities.push(activity);
            }
        }
    }
    activities
}
