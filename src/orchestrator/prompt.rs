//! Prompt assembly for the three worker kinds.

use std::fmt::Write;

use crate::tracker::Task;
use crate::worker::RESULT_FILE;

/// Cap on diff text embedded in a review prompt.
const MAX_REVIEW_DIFF_CHARS: usize = 60_000;

pub fn coder_prompt(task: &Task, retry_context: Option<&str>, review_issues: &[String]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Task {}: {}", task.id, task.title);
    if !task.description.trim().is_empty() {
        let _ = writeln!(prompt, "\n{}", task.description.trim());
    }

    if let Some(reason) = retry_context {
        let _ = writeln!(prompt, "\n## Previous attempt failed\n\n{}", reason);
    }
    if !review_issues.is_empty() {
        let _ = writeln!(prompt, "\n## Review issues to address\n");
        for issue in review_issues {
            let _ = writeln!(prompt, "- {}", issue);
        }
    }

    let _ = writeln!(
        prompt,
        "\n## When done\n\nCommit nothing yourself. Write `{}` with \
         {{\"status\": \"success\" | \"failure\", \"summary\": \"...\"}}.",
        RESULT_FILE
    );
    prompt
}

pub fn reviewer_prompt(task: &Task, summary: &str, diff: &str) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Review task {}: {}", task.id, task.title);
    if !task.description.trim().is_empty() {
        let _ = writeln!(prompt, "\n{}", task.description.trim());
    }
    if !summary.is_empty() {
        let _ = writeln!(prompt, "\n## Implementer summary\n\n{}", summary);
    }
    let _ = writeln!(prompt, "\n## Diff\n\n```diff\n{}\n```", clip(diff, MAX_REVIEW_DIFF_CHARS));
    let _ = writeln!(
        prompt,
        "\nWrite `{}` with {{\"status\": \"approved\" | \"rejected\", \"summary\": \"...\", \
         \"issues\": [\"...\"]}}.",
        RESULT_FILE
    );
    prompt
}

pub fn merger_prompt(task_id: &str, title: &str, operation: &str, files: &[String]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "# Resolve {} conflicts for task {}: {}\n",
        operation, task_id, title
    );
    let _ = writeln!(prompt, "Conflicted files:");
    for file in files {
        let _ = writeln!(prompt, "- {}", file);
    }
    let _ = writeln!(
        prompt,
        "\nEdit the files to keep both sides' intent and remove all conflict markers. \
         Do not run git commands. Write `{}` with {{\"status\": \"success\" | \"failure\"}}.",
        RESULT_FILE
    );
    prompt
}

pub fn epic_review_prompt(epic: &Task, children: &[Task]) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Final review of epic {}: {}", epic.id, epic.title);
    if !epic.description.trim().is_empty() {
        let _ = writeln!(prompt, "\n{}", epic.description.trim());
    }
    let _ = writeln!(prompt, "\n## Completed tasks\n");
    for child in children {
        let reason = child.close_reason.as_deref().unwrap_or("");
        let _ = writeln!(prompt, "- {} {}: {}", child.id, child.title, reason);
    }
    let _ = writeln!(
        prompt,
        "\nCheck trunk for gaps between the epic's goal and what was delivered. Write `{}` \
         with {{\"status\": \"approved\" | \"rejected\", \"issues\": [\"...\"]}}.",
        RESULT_FILE
    );
    prompt
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}\n... (diff truncated)", cut)
}
