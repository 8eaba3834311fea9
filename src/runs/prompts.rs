use std::fmt::Write;

use crate::agents::output::{COST_MARKER, DONE_MARKER, ESCALATION_MARKER, VERDICT_MARKER};
use crate::database::runs::Run;
use crate::database::work_orders::WorkOrder;
use crate::runs::status::ReviewerVerdict;

fn contract(prompt: &mut String, work_order: &WorkOrder) {
    let _ = writeln!(prompt, "# Work order {}: {}", work_order.id, work_order.title);
    let _ = writeln!(prompt, "\n## Goal\n{}", work_order.goal.trim());
    prompt.push_str("\n## Acceptance criteria\n");
    for item in work_order.acceptance_criteria.iter() {
        let _ = writeln!(prompt, "- {}", item);
    }
    prompt.push_str("\n## Stop conditions\n");
    for item in work_order.stop_conditions.iter() {
        let _ = writeln!(prompt, "- {}", item);
    }
}

/// Prompt for one builder pass, carrying forward whatever the previous
/// pass left behind.
pub fn builder_prompt(work_order: &WorkOrder, run: &Run) -> String {
    let mut prompt = String::new();
    contract(&mut prompt, work_order);

    let _ = writeln!(prompt, "\n## Iteration\nThis is builder iteration {}.", run.iteration);

    if run.reviewer_verdict == Some(ReviewerVerdict::ChangesRequested) {
        if let Some(notes) = run.reviewer_notes.as_deref().filter(|n| !n.trim().is_empty()) {
            let _ = writeln!(prompt, "\n## Reviewer feedback to address\n{}", notes.trim());
        }
    }

    if run.test_failures > 0 {
        if let Some(output) = run.last_test_output.as_deref().filter(|o| !o.trim().is_empty()) {
            let _ = writeln!(prompt, "\n## Failing test output\n```\n{}\n```", output.trim_end());
        }
    }

    if let Some(inputs) = run.provided_inputs.as_ref() {
        prompt.push_str("\n## Inputs provided by a human\n");
        for (key, value) in inputs.iter() {
            let rendered = value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            let _ = writeln!(prompt, "- {}: {}", key, rendered);
        }
    }

    let _ = write!(
        prompt,
        r#"
## Protocol
Work only inside the current directory. When the work is complete, print a line
`{done}`. If you cannot continue without information from a human, print one line
`{esc} {{"what_i_tried": "...", "what_i_need": "...", "inputs": [{{"key": "...", "label": "..."}}]}}`
and stop. You may report spend with `{cost} {{"usd": 0.0}}`.
"#,
        done = DONE_MARKER,
        esc = ESCALATION_MARKER,
        cost = COST_MARKER,
    );
    prompt
}

pub fn reviewer_prompt(work_order: &WorkOrder, run: &Run) -> String {
    let mut prompt = String::new();
    contract(&mut prompt, work_order);

    let _ = write!(
        prompt,
        r#"
## Review
You are reviewing iteration {iteration} of an automated change for this work order.
Inspect the working tree (for example with `git diff` and `git status`) against the
acceptance criteria. Do not modify files.

Finish with exactly one line:
`{verdict} {{"verdict": "approved" | "changes_requested", "notes": "..."}}`
"#,
        iteration = run.iteration,
        verdict = VERDICT_MARKER,
    );
    prompt
}

/// Last `lines` lines of `text`.
pub fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
