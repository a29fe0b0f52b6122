use std::collections::BTreeMap;
use std::fmt::Write;

use membreak_core::{ChangedFile, EvalQuestion, EvalTarget, SessionPhase};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::PromptSource;

const DEFAULT_MAX_FILE_CHARS: usize = 8_000;
const DEFAULT_MAX_TOTAL_CHARS: usize = 60_000;

const PRE_COMPRESSION: &str = "# Change Analysis

You have now seen every file touched by this change. Give a thorough, \
fact-based analysis:

1. What is the purpose of the change?
2. How is it implemented? Name the files, functions and types involved.
3. What behavior changed compared to before?
4. What could break, and where?

Base your answer only on the code shown above. Do not guess about code you \
have not seen.";

const DEEP_DIVE: &str = "# Technical Deep Dive

Look at the implementation details more closely. Pick a part of the change \
you have not discussed in depth yet and analyze:

1. Implementation patterns you observe
2. Error handling and edge cases
3. Integration points with the surrounding code
4. Anything you would question in review

Quote specific identifiers and values where you can.";

const MEMORY_ONLY: &str = "# Memory-Only Mode

From now on do NOT look at the code again. Answer purely from what you \
remember of this conversation.

Summarize, from memory:
1. The main purpose of the change
2. The most important files
3. The implementation details you still remember

If you do not remember something clearly, say so rather than guessing.";

const QUESTIONS: [&str; 8] = [
    // AR
    "What was the main purpose of this change?",
    "Which key files were changed, and what changed in each?",
    // TTL
    "How would you implement something similar in another part of this codebase?",
    "What was the most challenging part of this change, and why?",
    // LRU
    "How do these changes fit into the broader system architecture?",
    "Which other components could be affected by this change?",
    // SF
    "What would need to be reverted if this change were rolled back?",
    "Which parts of the change are core and which are peripheral?",
];

/// Fixed prompt templates with the changed files inlined into the init
/// prompt, truncated to stay within a sane size.
#[derive(Debug, Clone)]
pub struct TemplatePrompts {
    max_file_chars: usize,
    max_total_chars: usize,
}

impl Default for TemplatePrompts {
    fn default() -> Self {
        Self {
            max_file_chars: DEFAULT_MAX_FILE_CHARS,
            max_total_chars: DEFAULT_MAX_TOTAL_CHARS,
        }
    }
}

impl TemplatePrompts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(mut self, max_file_chars: usize, max_total_chars: usize) -> Self {
        self.max_file_chars = max_file_chars;
        self.max_total_chars = max_total_chars;
        self
    }

    fn render_init(&self, files: &[ChangedFile]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Code Change Under Review\n");
        let _ = writeln!(
            out,
            "This change touches {} file(s). Read them carefully; you will be \
             questioned about this change later.\n",
            files.len()
        );

        let _ = writeln!(out, "## Files\n");
        for file in files {
            let marker = if file.content.is_none() { " (deleted)" } else { "" };
            let _ = writeln!(out, "- {}{}", file.path, marker);
        }
        out.push('\n');

        for file in files {
            let mut section = format!("## {}\n\n", file.path);
            if let Some(content) = &file.content {
                let _ = writeln!(section, "```\n{}\n```\n", truncate(content, self.max_file_chars));
            }
            if !file.diff.is_empty() {
                let _ = writeln!(
                    section,
                    "Diff:\n```diff\n{}\n```\n",
                    truncate(&file.diff, self.max_file_chars)
                );
            }
            if out.len() + section.len() > self.max_total_chars {
                out.push_str("[remaining files omitted: size limit reached]\n");
                break;
            }
            out.push_str(&section);
        }
        out
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("\n... [truncated]");
    cut
}

impl PromptSource for TemplatePrompts {
    fn render(&self, phase: SessionPhase, files: &[ChangedFile]) -> String {
        match phase {
            SessionPhase::Init => self.render_init(files),
            SessionPhase::PreCompression => PRE_COMPRESSION.to_string(),
            SessionPhase::DeepDive => DEEP_DIVE.to_string(),
            SessionPhase::MemoryOnly => MEMORY_ONLY.to_string(),
            _ => String::new(),
        }
    }

    fn evaluation_questions(&self, _target: &EvalTarget) -> Vec<EvalQuestion> {
        QUESTIONS.iter().map(|q| EvalQuestion::new(*q)).collect()
    }
}

/// Every prompt a session will send, rendered once per task and shared by
/// all sessions.
#[derive(Debug, Clone, Serialize)]
pub struct PromptSet {
    pub init: String,
    pub pre_compression: String,
    pub deep_dive: String,
    pub memory_only: String,
    pub questions: Vec<EvalQuestion>,
    pub hash: String,
}

impl PromptSet {
    pub fn build(source: &dyn PromptSource, target: &EvalTarget, files: &[ChangedFile]) -> Self {
        let init = source.render(SessionPhase::Init, files);
        let pre_compression = source.render(SessionPhase::PreCompression, files);
        let deep_dive = source.render(SessionPhase::DeepDive, files);
        let memory_only = source.render(SessionPhase::MemoryOnly, files);
        let questions = source.evaluation_questions(target);

        let mut named = BTreeMap::new();
        named.insert("init".to_string(), init.clone());
        named.insert("pre_compression".to_string(), pre_compression.clone());
        named.insert("deep_dive".to_string(), deep_dive.clone());
        named.insert("memory_only".to_string(), memory_only.clone());
        for (i, q) in questions.iter().enumerate() {
            named.insert(format!("question_{i:02}"), q.question.clone());
        }

        Self {
            init,
            pre_compression,
            deep_dive,
            memory_only,
            questions,
            hash: prompt_hash(&named),
        }
    }
}

/// Short, order-independent fingerprint of a set of named prompts.
pub fn prompt_hash(prompts: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, text) in prompts {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        hasher.update(b"\n");
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(16);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> Vec<ChangedFile> {
        vec![
            ChangedFile {
                path: "src/cache.rs".to_string(),
                content: Some("pub struct Cache;".to_string()),
                diff: "+pub struct Cache;".to_string(),
            },
            ChangedFile {
                path: "src/old.rs".to_string(),
                content: None,
                diff: "-fn old() {}".to_string(),
            },
        ]
    }

    #[test]
    fn test_init_prompt_lists_files_and_contents() {
        let prompt = TemplatePrompts::new().render(SessionPhase::Init, &files());
        assert!(prompt.contains("- src/cache.rs"));
        assert!(prompt.contains("- src/old.rs (deleted)"));
        assert!(prompt.contains("pub struct Cache;"));
        assert!(prompt.contains("-fn old() {}"));
    }

    #[test]
    fn test_init_prompt_respects_limits() {
        let big = vec![ChangedFile {
            path: "big.txt".to_string(),
            content: Some("x".repeat(500)),
            diff: String::new(),
        }];
        let prompt = TemplatePrompts::new().with_limits(100, 10_000).render(SessionPhase::Init, &big);
        assert!(prompt.contains("[truncated]"));

        let prompt = TemplatePrompts::new().with_limits(100, 50).render(SessionPhase::Init, &big);
        assert!(prompt.contains("size limit reached"));
    }

    #[test]
    fn test_default_questions() {
        let target = EvalTarget::new(".", "main", "topic");
        let questions = TemplatePrompts::new().evaluation_questions(&target);
        assert_eq!(questions.len(), 8);
        assert!(questions.iter().all(|q| q.reference.is_none()));
    }

    #[test]
    fn test_prompt_set_hash_is_stable() {
        let target = EvalTarget::new(".", "main", "topic");
        let a = PromptSet::build(&TemplatePrompts::new(), &target, &files());
        let b = PromptSet::build(&TemplatePrompts::new(), &target, &files());
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 16);

        let c = PromptSet::build(&TemplatePrompts::new(), &target, &files()[..1]);
        assert_ne!(a.hash, c.hash);
    }
}
