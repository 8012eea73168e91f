//! Decides what kind of answer the model gave.
//!
//! The one-liner heuristic lives behind [`OneLinerPolicy`] so it can be tuned
//! or swapped. Raw, just-answer and snippet output are variants of the same
//! result type rather than separate code paths.

use crate::config::Mode;
use tracing::debug;

/// Longest reply still handed to the shell prompt as a one-liner.
pub const DEFAULT_MAX_ONE_LINER_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedResult {
    /// A single command for the interactive prompt.
    OneLiner { command: String },
    /// A multi-line program to be saved and invoked.
    Script { language: Mode, body: String },
    /// Text printed as-is (raw or just-answer output).
    Verbatim { text: String },
    /// Cleaned code shown to the user and copied, never saved.
    Snippet { language: Mode, body: String },
}

/// Policy deciding whether cleaned text fits on a shell prompt.
pub trait OneLinerPolicy: Send + Sync {
    fn is_one_liner(&self, text: &str) -> bool;
}

/// No line breaks and shorter than `max_len` characters.
pub struct LineLengthPolicy {
    pub max_len: usize,
}

impl Default for LineLengthPolicy {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_ONE_LINER_LEN,
        }
    }
}

impl OneLinerPolicy for LineLengthPolicy {
    fn is_one_liner(&self, text: &str) -> bool {
        !text.contains('\n') && text.chars().count() < self.max_len
    }
}

/// Bypass switches from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyOptions {
    pub raw: bool,
    pub just_answer: bool,
    pub snippet: bool,
}

/// A fenced code block: its language tag (possibly empty) and code.
#[derive(Debug, Clone, PartialEq)]
pub struct FencedBlock {
    pub language: String,
    pub code: String,
}

/// Extracts all complete ```` ``` ```` fenced blocks.
pub fn extract_fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match current.take() {
            None => {
                if let Some(tag) = trimmed.strip_prefix("```") {
                    let language = tag.split_whitespace().next().unwrap_or("").to_string();
                    current = Some((language, Vec::new()));
                }
            }
            Some((language, mut lines)) => {
                if trimmed.starts_with("```") {
                    blocks.push(FencedBlock {
                        language,
                        code: lines.join("\n"),
                    });
                } else {
                    lines.push(line);
                    current = Some((language, lines));
                }
            }
        }
    }
    blocks
}

fn tidy(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Removes fence markup. When the reply contains fenced blocks only their code
/// is kept; otherwise stray fence lines are dropped.
pub fn strip_fences(text: &str) -> String {
    let blocks = extract_fenced_blocks(text);
    if !blocks.is_empty() {
        let code: Vec<String> = blocks.iter().map(|b| tidy(&b.code)).collect();
        return tidy(&code.join("\n"));
    }
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim().starts_with("```"))
        .collect();
    tidy(&kept.join("\n"))
}

/// Pure classification of a model reply.
pub struct ResponseClassifier {
    policy: Box<dyn OneLinerPolicy>,
}

impl Default for ResponseClassifier {
    fn default() -> Self {
        Self::new(Box::new(LineLengthPolicy::default()))
    }
}

impl ResponseClassifier {
    pub fn new(policy: Box<dyn OneLinerPolicy>) -> Self {
        Self { policy }
    }

    /// Classifies a model reply.
    ///
    /// # Arguments
    ///
    /// * `reply` - The raw reply content
    /// * `mode` - The configured mode, used when no fence names a language
    /// * `options` - Raw, just-answer and snippet switches
    ///
    /// # Returns
    ///
    /// `Verbatim` for raw and just-answer output, `Snippet` in snippet mode,
    /// otherwise `OneLiner` or `Script` as decided by the [`OneLinerPolicy`].
    pub fn classify(&self, reply: &str, mode: Mode, options: ClassifyOptions) -> ClassifiedResult {
        if options.raw {
            return ClassifiedResult::Verbatim {
                text: reply.to_string(),
            };
        }

        let cleaned = strip_fences(reply);
        if options.just_answer {
            return ClassifiedResult::Verbatim { text: cleaned };
        }

        let language = extract_fenced_blocks(reply)
            .iter()
            .find_map(|block| Mode::from_fence_tag(&block.language))
            .unwrap_or(mode);

        if options.snippet {
            return ClassifiedResult::Snippet {
                language,
                body: cleaned,
            };
        }

        if self.policy.is_one_liner(&cleaned) {
            debug!("Classified reply as one-liner");
            ClassifiedResult::OneLiner { command: cleaned }
        } else {
            debug!("Classified reply as {} script", language);
            ClassifiedResult::Script {
                language,
                body: cleaned,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(reply: &str, mode: Mode) -> ClassifiedResult {
        ResponseClassifier::default().classify(reply, mode, ClassifyOptions::default())
    }

    #[test]
    fn test_plain_command_is_one_liner() {
        assert_eq!(
            classify("find . -size +100M", Mode::Bash),
            ClassifiedResult::OneLiner {
                command: "find . -size +100M".to_string()
            }
        );
    }

    #[test]
    fn test_fenced_one_liner_is_unwrapped() {
        assert_eq!(
            classify("```bash\ndu -sh * | sort -h\n```\n", Mode::Bash),
            ClassifiedResult::OneLiner {
                command: "du -sh * | sort -h".to_string()
            }
        );
    }

    #[test]
    fn test_multi_line_python_is_script() {
        let reply = "```python\nimport sys\nprint(sys.argv)\n```";
        assert_eq!(
            classify(reply, Mode::Python),
            ClassifiedResult::Script {
                language: Mode::Python,
                body: "import sys\nprint(sys.argv)".to_string()
            }
        );
    }

    #[test]
    fn test_fence_annotation_overrides_mode() {
        let reply = "Here you go:\n```py\nfor i in range(3):\n    print(i)\n```\nEnjoy!";
        match classify(reply, Mode::Bash) {
            ClassifiedResult::Script { language, body } => {
                assert_eq!(language, Mode::Python);
                assert_eq!(body, "for i in range(3):\n    print(i)");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fence_tag_keeps_mode() {
        let reply = "```text\nline one\nline two\n```";
        assert!(matches!(
            classify(reply, Mode::Zsh),
            ClassifiedResult::Script { language: Mode::Zsh, .. }
        ));
    }

    #[test]
    fn test_long_line_is_script() {
        let long = format!("echo {}", "x".repeat(DEFAULT_MAX_ONE_LINER_LEN));
        assert!(matches!(classify(&long, Mode::Bash), ClassifiedResult::Script { .. }));
    }

    #[test]
    fn test_raw_bypasses_everything() {
        let reply = "```bash\nls\n```";
        let options = ClassifyOptions {
            raw: true,
            ..ClassifyOptions::default()
        };
        assert_eq!(
            ResponseClassifier::default().classify(reply, Mode::Bash, options),
            ClassifiedResult::Verbatim {
                text: reply.to_string()
            }
        );
    }

    #[test]
    fn test_just_answer_strips_fences_only() {
        let options = ClassifyOptions {
            just_answer: true,
            ..ClassifyOptions::default()
        };
        let result = ResponseClassifier::default().classify(
            "A pipe connects stdout to stdin.\n\nSecond paragraph.",
            Mode::Bash,
            options,
        );
        assert_eq!(
            result,
            ClassifiedResult::Verbatim {
                text: "A pipe connects stdout to stdin.\n\nSecond paragraph.".to_string()
            }
        );
    }

    #[test]
    fn test_snippet_is_not_saved_even_when_multi_line() {
        let options = ClassifyOptions {
            snippet: true,
            ..ClassifyOptions::default()
        };
        let result = ResponseClassifier::default().classify("a = 1\nprint(a)", Mode::Python, options);
        assert!(matches!(result, ClassifiedResult::Snippet { language: Mode::Python, .. }));
    }

    #[test]
    fn test_custom_policy_is_honored() {
        struct NeverOneLiner;
        impl OneLinerPolicy for NeverOneLiner {
            fn is_one_liner(&self, _text: &str) -> bool {
                false
            }
        }
        let classifier = ResponseClassifier::new(Box::new(NeverOneLiner));
        assert!(matches!(
            classifier.classify("ls", Mode::Sh, ClassifyOptions::default()),
            ClassifiedResult::Script { language: Mode::Sh, .. }
        ));
    }

    #[test]
    fn test_strip_fences_without_closing_fence() {
        assert_eq!(strip_fences("```bash\nls -la   \n"), "ls -la");
    }

    #[test]
    fn test_extract_multiple_blocks() {
        let blocks = extract_fenced_blocks("```sh\na\n```\ntext\n```\nb\nc\n```");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].language, "sh");
        assert_eq!(blocks[1].language, "");
        assert_eq!(blocks[1].code, "b\nc");
        assert_eq!(strip_fences("```sh\na\n```\ntext\n```\nb\nc\n```"), "a\nb\nc");
    }
}
