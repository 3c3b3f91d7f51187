//! Explicit facts stated in a user turn.
//!
//! Only two phrasings are recognised: "my name is X" and "remember (that) X".
//! Questions ("do you remember ...?") are not treated as instructions.

/// Importance given to memories the user explicitly asked to keep.
pub const REMEMBERED_IMPORTANCE: i32 = 7;

/// Category of memories the user explicitly asked to keep.
pub const REMEMBERED_CATEGORY: &str = "user";

const MAX_NAME_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedFact {
    Name(String),
    Memory(String),
}

pub fn extract_facts(message: &str) -> Vec<ExtractedFact> {
    let mut facts = Vec::new();
    if let Some(name) = extract_name(message) {
        facts.push(ExtractedFact::Name(name));
    }
    if let Some(memory) = extract_memory(message) {
        facts.push(ExtractedFact::Memory(memory));
    }
    facts
}

/// Byte offset just past `phrase` at a word boundary, case-insensitive.
fn find_phrase(message: &str, phrase: &str) -> Option<usize> {
    // ASCII lowercasing keeps byte offsets aligned with `message`.
    let lower = message.to_ascii_lowercase();
    lower.match_indices(phrase).find_map(|(start, _)| {
        let at_boundary = lower[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        at_boundary.then_some(start + phrase.len())
    })
}

fn extract_name(message: &str) -> Option<String> {
    let rest = &message[find_phrase(message, "my name is ")?..];
    let clause = rest
        .split(['.', '!', '?', ',', ';', '\n'])
        .next()
        .unwrap_or_default();
    let clause = clause
        .split(" and ")
        .next()
        .unwrap_or_default()
        .split(" but ")
        .next()
        .unwrap_or_default()
        .trim();

    if clause.is_empty() || clause.chars().count() > MAX_NAME_CHARS {
        return None;
    }
    Some(clause.to_string())
}

fn extract_memory(message: &str) -> Option<String> {
    let trimmed = message.trim();
    if trimmed.ends_with('?') {
        return None;
    }
    let start = find_phrase(trimmed, "remember ")?;
    let mut rest = trimmed[start..].trim_start();
    if rest.to_ascii_lowercase().starts_with("that ") {
        rest = &rest[5..];
    }
    let fact = rest.trim().trim_end_matches(['.', '!']).trim();
    (!fact.is_empty()).then(|| fact.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_statement() {
        assert_eq!(
            extract_facts("Hi, my name is Sam."),
            vec![ExtractedFact::Name("Sam".into())]
        );
        assert_eq!(
            extract_facts("My name is Ada Lovelace and I like maths"),
            vec![ExtractedFact::Name("Ada Lovelace".into())]
        );
    }

    #[test]
    fn remember_statement() {
        assert_eq!(
            extract_facts("Remember that I park on level 3."),
            vec![ExtractedFact::Memory("I park on level 3".into())]
        );
        assert_eq!(
            extract_facts("please remember my locker code is 4411"),
            vec![ExtractedFact::Memory("my locker code is 4411".into())]
        );
    }

    #[test]
    fn questions_and_lookalikes_are_ignored() {
        assert!(extract_facts("Do you remember where I parked?").is_empty());
        assert!(extract_facts("What is my name?").is_empty());
        assert!(extract_facts("I misremember things").is_empty());
        assert!(extract_facts("my name is").is_empty());
    }

    #[test]
    fn both_in_one_turn() {
        let facts = extract_facts("My name is Sam, remember that I take the 8:10 train");
        assert_eq!(
            facts,
            vec![
                ExtractedFact::Name("Sam".into()),
                ExtractedFact::Memory("I take the 8:10 train".into()),
            ]
        );
    }
}
