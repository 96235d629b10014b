//! Screenplay text to character roster and ordered dialogue chunks.
//!
//! The parser never fails. Lines it cannot attribute to a speaker are
//! returned as diagnostics next to the result.

use crate::core::state::{DefinedCharacter, DialogueChunk};
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

const MAX_CUE_WORDS: usize = 4;
const MAX_CUE_CHARS: usize = 40;

static PARENTHETICAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\([^)]*\)").unwrap());
static BRACKETED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]*\]").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static CONTD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCONT(?:'|’)?D\b\.?").unwrap());
static NAME_NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s'\-]").unwrap());
static CHARACTERS_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:#+\s*)?characters\s*:?$").unwrap());
static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-*•]\s*(.*)$").unwrap());
static SCENE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:INT\.?/EXT|EXT\.?/INT|I/E|INT|EXT|EST)(?:[.\s]|$)|(?:SCENE|Scene)\s+\d+|ACT\s+(?:[IVXLC]+|\d+)\b)",
    )
    .unwrap()
});
static TRANSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:FADE (?:IN|OUT|TO BLACK)|CUT TO|SMASH CUT|MATCH CUT|JUMP CUT|DISSOLVE TO|WIPE TO|IRIS (?:IN|OUT)|THE END)\b[^a-z]*|[A-Z][A-Z ]* TO:)$",
    )
    .unwrap()
});
static INLINE_DIALOGUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]{1,60}?)\s*:\s*(.+)$").unwrap());
static CUE_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{Lu}\p{N}][\p{Lu}\p{N}\s'.\-]*$").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedLine {
    pub line_number: usize,
    pub content: String,
}

/// An alias claimed by one character while another also generated it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AliasCollision {
    pub alias: String,
    pub kept: String,
    pub shadowed: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParseDiagnostics {
    pub unmatched_lines: Vec<UnmatchedLine>,
    pub alias_collisions: Vec<AliasCollision>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParsedScript {
    /// Canonical names, sorted and unique.
    pub characters: Vec<String>,
    pub defined_characters: Vec<DefinedCharacter>,
    pub dialogue_chunks: Vec<DialogueChunk>,
    pub diagnostics: ParseDiagnostics,
}

/// Uppercases a raw name and strips annotations and punctuation.
pub fn normalize_name(raw: &str) -> String {
    let without_parens = PARENTHETICAL.replace_all(raw, " ");
    let without_contd = CONTD.replace_all(&without_parens, " ");
    let stripped = NAME_NOISE.replace_all(&without_contd, "");
    collapse_whitespace(&stripped).to_uppercase()
}

/// Every alias a full name can be referred to by: the full name, each token,
/// each contiguous token run, and first + last token.
pub fn generate_aliases(full_name: &str) -> BTreeSet<String> {
    let tokens: Vec<&str> = full_name.split_whitespace().collect();
    let mut aliases = BTreeSet::new();
    if tokens.is_empty() {
        return aliases;
    }

    aliases.insert(tokens.join(" "));
    for len in 1..=tokens.len() {
        for start in 0..=tokens.len() - len {
            aliases.insert(tokens[start..start + len].join(" "));
        }
    }
    if tokens.len() > 2 {
        aliases.insert(format!("{} {}", tokens[0], tokens[tokens.len() - 1]));
    }
    aliases
}

/// Text sent to speech synthesis: annotations removed, whitespace collapsed.
pub fn clean_dialogue(text: &str) -> String {
    let without_parens = PARENTHETICAL.replace_all(text, " ");
    let without_brackets = BRACKETED.replace_all(&without_parens, " ");
    collapse_whitespace(&without_brackets)
}

pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").trim().to_string()
}

fn has_letter(text: &str) -> bool {
    text.chars().any(char::is_alphabetic)
}

fn is_scene_heading(line: &str) -> bool {
    SCENE_HEADING.is_match(line)
}

fn is_transition(line: &str) -> bool {
    TRANSITION.is_match(line)
}

/// Strips `(V.O.)`, `(CONT'D)` and similar from a cue line.
fn strip_cue_annotations(line: &str) -> String {
    let without_parens = PARENTHETICAL.replace_all(line, " ");
    collapse_whitespace(&CONTD.replace_all(&without_parens, " "))
}

/// Whether text is shaped like an uppercase speaker cue that can be registered.
fn looks_like_cue(text: &str) -> bool {
    let text = text.trim();
    has_letter(text)
        && !text.chars().any(char::is_lowercase)
        && !text.ends_with('.')
        && CUE_SHAPE.is_match(text)
        && text.split_whitespace().count() <= MAX_CUE_WORDS
        && text.chars().count() <= MAX_CUE_CHARS
}

/// Alias table mapping every alias to its canonical character name.
#[derive(Debug, Default, Clone)]
pub struct CharacterRoster {
    characters: Vec<DefinedCharacter>,
    alias_map: HashMap<String, String>,
    collisions: Vec<AliasCollision>,
}

impl CharacterRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a character and returns its canonical name. Derived aliases
    /// already claimed by an earlier character stay with that character; a
    /// character's own full name always resolves to itself.
    pub fn register(&mut self, raw_name: &str) -> Option<String> {
        let full_name = normalize_name(raw_name);
        if full_name.is_empty() || !has_letter(&full_name) {
            return None;
        }
        if self.characters.iter().any(|c| c.full_name == full_name) {
            return Some(full_name);
        }

        let aliases = generate_aliases(&full_name);
        for alias in &aliases {
            match self.alias_map.get(alias) {
                None => {
                    self.alias_map.insert(alias.clone(), full_name.clone());
                }
                Some(owner) if *alias == full_name => {
                    warn!(
                        "Alias {} now refers to character {} instead of {}",
                        alias, full_name, owner
                    );
                    self.collisions.push(AliasCollision {
                        alias: alias.clone(),
                        kept: full_name.clone(),
                        shadowed: owner.clone(),
                    });
                    self.alias_map.insert(alias.clone(), full_name.clone());
                }
                Some(owner) => {
                    warn!(
                        "Alias {} of {} is already taken by {}",
                        alias, full_name, owner
                    );
                    self.collisions.push(AliasCollision {
                        alias: alias.clone(),
                        kept: owner.clone(),
                        shadowed: full_name.clone(),
                    });
                }
            }
        }

        debug!("Registered character {} ({} aliases)", full_name, aliases.len());
        self.characters.push(DefinedCharacter {
            full_name: full_name.clone(),
            aliases,
        });
        Some(full_name)
    }

    /// Looks up any spelling of a name, case-insensitively.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let normalized = normalize_name(name);
        if normalized.is_empty() {
            return None;
        }
        self.alias_map.get(&normalized).map(String::as_str)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.characters.iter().map(|c| c.full_name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn characters(&self) -> &[DefinedCharacter] {
        &self.characters
    }

    pub fn collisions(&self) -> &[AliasCollision] {
        &self.collisions
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Metadata,
    CharacterList,
    ScriptBody,
}

#[derive(Debug)]
pub struct ScreenplayParser {
    mode: Mode,
    roster: CharacterRoster,
    chunks: Vec<DialogueChunk>,
    unmatched: Vec<UnmatchedLine>,
    speaker: Option<String>,
    buffer: Vec<String>,
}

impl Default for ScreenplayParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a whole script in one go.
pub fn parse(script_text: &str) -> ParsedScript {
    ScreenplayParser::new().parse(script_text)
}

impl ScreenplayParser {
    pub fn new() -> Self {
        Self {
            mode: Mode::Metadata,
            roster: CharacterRoster::new(),
            chunks: Vec::new(),
            unmatched: Vec::new(),
            speaker: None,
            buffer: Vec::new(),
        }
    }

    pub fn parse(mut self, script_text: &str) -> ParsedScript {
        for (i, raw_line) in script_text.lines().enumerate() {
            let line_number = i + 1;
            let line = raw_line.trim();

            match self.mode {
                Mode::Metadata => self.handle_metadata_line(line_number, line),
                Mode::CharacterList => self.handle_character_list_line(line_number, line),
                Mode::ScriptBody => self.handle_body_line(line_number, line),
            }
        }
        self.flush();

        debug!(
            "Parsed {} characters, {} chunks, {} unmatched lines",
            self.roster.characters().len(),
            self.chunks.len(),
            self.unmatched.len()
        );

        ParsedScript {
            characters: self.roster.names(),
            defined_characters: self.roster.characters().to_vec(),
            dialogue_chunks: self.chunks,
            diagnostics: ParseDiagnostics {
                unmatched_lines: self.unmatched,
                alias_collisions: self.roster.collisions().to_vec(),
            },
        }
    }

    fn handle_metadata_line(&mut self, line_number: usize, line: &str) {
        if CHARACTERS_HEADER.is_match(line) {
            self.mode = Mode::CharacterList;
            return;
        }
        // Scripts without a character list start straight at the body.
        if is_scene_heading(line) || self.inline_candidate(line).is_some() {
            self.mode = Mode::ScriptBody;
            self.handle_body_line(line_number, line);
        }
    }

    fn handle_character_list_line(&mut self, line_number: usize, line: &str) {
        if line.is_empty() || CHARACTERS_HEADER.is_match(line) {
            return;
        }
        match LIST_ITEM.captures(line) {
            Some(caps) => {
                let declaration = caps.get(1).map_or("", |m| m.as_str());
                let name = declaration_name(declaration);
                if has_letter(&name) {
                    self.roster.register(&name);
                }
            }
            None => {
                self.mode = Mode::ScriptBody;
                self.handle_body_line(line_number, line);
            }
        }
    }

    fn handle_body_line(&mut self, line_number: usize, line: &str) {
        if line.is_empty() || is_scene_heading(line) || is_transition(line) {
            self.flush();
            self.speaker = None;
            return;
        }

        if let Some((raw_name, dialogue)) = self.inline_candidate(line) {
            self.flush();
            self.speaker = None;
            if let Some(character) = self.resolve_or_register(&raw_name) {
                self.emit(&character, &dialogue);
            }
            return;
        }

        if let Some(character) = self.match_cue(line) {
            self.flush();
            self.speaker = Some(character);
            return;
        }

        if self.speaker.is_some() {
            self.buffer.push(line.to_string());
        } else {
            self.unmatched.push(UnmatchedLine {
                line_number,
                content: line.to_string(),
            });
        }
    }

    /// `NAME: dialogue` where NAME is a known alias or shaped like a cue.
    fn inline_candidate(&self, line: &str) -> Option<(String, String)> {
        let caps = INLINE_DIALOGUE.captures(line)?;
        let raw_name = caps.get(1)?.as_str();
        let dialogue = caps.get(2)?.as_str().trim();
        if dialogue.is_empty() {
            return None;
        }

        let name = strip_cue_annotations(raw_name);
        if self.roster.resolve(&name).is_some() || looks_like_cue(&name) {
            Some((name, dialogue.to_string()))
        } else {
            None
        }
    }

    /// A standalone line naming the speaker of the following block.
    fn match_cue(&mut self, line: &str) -> Option<String> {
        let name = strip_cue_annotations(line);
        if name.is_empty() || name.contains(['?', '!', ',', ';', '"']) {
            return None;
        }
        if let Some(character) = self.roster.resolve(&name) {
            return Some(character.to_string());
        }
        if looks_like_cue(&name) {
            return self.roster.register(&name);
        }
        None
    }

    fn resolve_or_register(&mut self, name: &str) -> Option<String> {
        match self.roster.resolve(name) {
            Some(character) => Some(character.to_string()),
            None => self.roster.register(name),
        }
    }

    fn emit(&mut self, character: &str, original_text: &str) {
        let text = clean_dialogue(original_text);
        if text.is_empty() {
            debug!("Dropping empty dialogue for {}", character);
            return;
        }
        self.chunks.push(DialogueChunk::new(character, &text, original_text));
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let block = self.buffer.join(" ");
        self.buffer.clear();
        if let Some(character) = self.speaker.clone() {
            self.emit(&character, &block);
        }
    }
}

/// Name part of a `- NAME (annotation)` declaration.
fn declaration_name(declaration: &str) -> String {
    let without_parens = PARENTHETICAL.replace_all(declaration, " ");
    let mut name = without_parens.as_ref();
    for separator in [":", ",", "(", " - ", " – ", " — "] {
        if let Some(idx) = name.find(separator) {
            name = &name[..idx];
        }
    }
    name.trim().to_string()
}
