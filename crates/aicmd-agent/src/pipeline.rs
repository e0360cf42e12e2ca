use crate::highlight::{HighlightStyle, dedup_candidates, highlight_tokens, normalize_command};
use aicmd_context::{ContextCatalog, ContextMode, ContextSelector, ResolvedContext};
use aicmd_core::{AicmdError, CompletionRequest, Platform, PipelineConfig};
use aicmd_llm::LlmClient;
use aicmd_observe::Observer;
use aicmd_store::ResultCache;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

pub const GENERATE_OP: &str = "generate_command";
pub const EXPLAIN_OP: &str = "explain_command";
pub const ALTERNATIVES_OP: &str = "generate_alternatives";

/// User interaction seen by the pipeline. Answers are returned raw; the
/// pipeline decides what they mean.
pub trait Prompter {
    fn show_command(&mut self, command: &str);
    fn show_explanation(&mut self, explanation: &str);
    /// Ask whether to run `command`.
    fn confirm(&mut self, command: &str) -> Result<String>;
    fn show_candidates(&mut self, candidates: &[Candidate]);
    /// Ask for an index into the candidates just shown.
    fn choose(&mut self, count: usize) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Hand `command` to `shell`.
    Execute { command: String, shell: String },
    /// Dry run: the command was shown and nothing else happens.
    Printed {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub context: ContextMode,
    pub explain: bool,
    pub alternatives: u32,
    pub dry_run: bool,
    pub assume_yes: bool,
    pub color: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            context: ContextMode::None,
            explain: false,
            alternatives: 5,
            dry_run: false,
            assume_yes: false,
            color: true,
        }
    }
}

/// `n`/`no` (any case) rejects; everything else, including an empty line, accepts.
pub fn is_rejection(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no")
}

/// Parse a candidate pick. Anything but an in-range index is an error.
pub fn parse_choice(input: &str, count: usize) -> Result<usize, AicmdError> {
    input
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|index| *index < count)
        .ok_or_else(|| AicmdError::InvalidSelection {
            input: input.trim().to_string(),
            count,
        })
}

/// Single-shot flow: context, generate, explain, confirm, alternatives,
/// handoff. Never executes anything itself.
pub struct CommandPipeline<'a> {
    llm: &'a dyn LlmClient,
    cache: &'a ResultCache,
    catalog: &'a ContextCatalog,
    platform: &'a Platform,
    cfg: &'a PipelineConfig,
    observer: Arc<Observer>,
}

impl<'a> CommandPipeline<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        cache: &'a ResultCache,
        catalog: &'a ContextCatalog,
        platform: &'a Platform,
        cfg: &'a PipelineConfig,
        observer: Arc<Observer>,
    ) -> Self {
        Self {
            llm,
            cache,
            catalog,
            platform,
            cfg,
            observer,
        }
    }

    pub fn run(
        &self,
        query: &str,
        opts: &PipelineOptions,
        prompter: &mut dyn Prompter,
    ) -> Result<PipelineOutcome> {
        let context = self.resolve_context(opts.context, query)?;
        let command = self.generate(query, context.as_ref())?;
        prompter.show_command(&command);

        let explanation = if opts.explain {
            let text = self.explain(&command)?;
            prompter.show_explanation(&highlight_tokens(&text, &command, style(opts)));
            Some(text)
        } else {
            None
        };

        if opts.dry_run {
            return Ok(PipelineOutcome::Printed {
                command,
                explanation,
            });
        }
        if opts.assume_yes || !is_rejection(&prompter.confirm(&command)?) {
            return Ok(self.handoff(command));
        }

        self.observer.record("PIPELINE_REJECT", "requesting alternatives");
        let commands = self.alternatives(query, context.as_ref(), opts.alternatives)?;
        if commands.is_empty() {
            return Err(
                AicmdError::Aborted("no alternative commands were produced".to_string()).into(),
            );
        }
        let mut candidates = Vec::with_capacity(commands.len());
        for command in commands {
            let explanation = if opts.explain {
                let text = self.explain(&command)?;
                Some(highlight_tokens(&text, &command, style(opts)))
            } else {
                None
            };
            candidates.push(Candidate {
                command,
                explanation,
            });
        }
        prompter.show_candidates(&candidates);
        let picked = parse_choice(&prompter.choose(candidates.len())?, candidates.len())?;
        let chosen = candidates.swap_remove(picked);
        Ok(self.handoff(chosen.command))
    }

    fn handoff(&self, command: String) -> PipelineOutcome {
        self.observer
            .record("PIPELINE_EXECUTE", &format!("shell={}", self.platform.shell));
        PipelineOutcome::Execute {
            command,
            shell: self.platform.shell.clone(),
        }
    }

    pub fn resolve_context(
        &self,
        mode: ContextMode,
        query: &str,
    ) -> Result<Option<ResolvedContext>> {
        ContextSelector::new(self.catalog, self.cache, self.llm, Arc::clone(&self.observer))
            .with_char_limit(self.cfg.context_char_limit)
            .resolve(mode, query)
    }

    /// The generation prompt, with the context block first when present.
    pub fn command_prompt(&self, query: &str, context: Option<&ResolvedContext>) -> String {
        let ask = format!(
            "Write a single {} command for {} that does the following: {query}",
            self.platform.shell_name(),
            self.platform.family
        );
        match context {
            Some(ctx) => format!("Context ({}):\n{}\n\n{ask}", ctx.name, ctx.text),
            None => ask,
        }
    }

    /// Generate one command, memoized on platform, shell, context and query.
    pub fn generate(&self, query: &str, context: Option<&ResolvedContext>) -> Result<String> {
        let (name, text) = context_parts(context);
        let args = [
            self.platform.family.as_str(),
            self.platform.shell.as_str(),
            name,
            text,
            query,
        ];
        self.cache.cached_text(GENERATE_OP, &args, || {
            let req = CompletionRequest {
                max_tokens: self.cfg.command_max_tokens,
                ..CompletionRequest::new(self.command_prompt(query, context))
            };
            let reply = self.llm.complete(&req)?.into_iter().next().unwrap_or_default();
            let command = normalize_command(&reply);
            if command.is_empty() {
                self.observer
                    .warn_log("completion service returned no command; using fallback");
                return Ok(self.cfg.fallback_command.clone());
            }
            Ok(command)
        })
    }

    pub fn explain(&self, command: &str) -> Result<String> {
        self.cache.cached_text(EXPLAIN_OP, &[command], || {
            let req = CompletionRequest {
                max_tokens: self.cfg.explain_max_tokens,
                ..CompletionRequest::new(format!(
                    "Explain briefly what the following {} command does:\n\n{command}",
                    self.platform.shell_name()
                ))
            };
            Ok(self
                .llm
                .complete(&req)?
                .into_iter()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string())
        })
    }

    /// `n` sampled alternatives, normalized and deduplicated.
    pub fn alternatives(
        &self,
        query: &str,
        context: Option<&ResolvedContext>,
        n: u32,
    ) -> Result<Vec<String>> {
        let (name, text) = context_parts(context);
        let count = n.to_string();
        let args = [
            self.platform.family.as_str(),
            self.platform.shell.as_str(),
            name,
            text,
            query,
            count.as_str(),
        ];
        self.cache.cached_list(ALTERNATIVES_OP, &args, || {
            let req = CompletionRequest {
                prompt: self.command_prompt(query, context),
                temperature: self.cfg.alternatives_temperature,
                max_tokens: self.cfg.command_max_tokens,
                top_p: 1.0,
                n,
            };
            let choices = self.llm.complete(&req)?;
            Ok(dedup_candidates(
                choices
                    .iter()
                    .map(|choice| normalize_command(choice))
                    .filter(|command| !command.is_empty()),
            ))
        })
    }
}

fn context_parts(context: Option<&ResolvedContext>) -> (&str, &str) {
    context.map_or(("", ""), |ctx| (ctx.name.as_str(), ctx.text.as_str()))
}

fn style(opts: &PipelineOptions) -> HighlightStyle<'static> {
    if opts.color {
        HighlightStyle::ANSI
    } else {
        HighlightStyle::PLAIN
    }
}
