//! Assembles earlier step results into the context of a dependent step.

use loca_db::models::WorkflowStep;

/// First line of every built context.
pub const CONTEXT_HEADER: &str = "Context from previous steps:";

/// Build the context message for `step` from the results of its declared
/// dependencies, in declared order.
///
/// Returns `None` when the step declares no dependencies or none of them
/// has produced a result yet. Unknown dependency ids are skipped.
pub fn build_step_context(steps: &[WorkflowStep], step: &WorkflowStep) -> Option<String> {
    if step.depends_on.is_empty() {
        return None;
    }

    let mut context = String::from(CONTEXT_HEADER);
    let mut contributed = false;
    for dep_id in &step.depends_on {
        let Some(dep) = steps.iter().find(|s| s.id == *dep_id) else {
            continue;
        };
        if let Some(result) = &dep.result {
            context.push('\n');
            context.push_str(&dep.name);
            context.push_str(": ");
            context.push_str(result);
            contributed = true;
        }
    }

    contributed.then_some(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn step(name: &str, result: Option<&str>) -> WorkflowStep {
        let mut s = WorkflowStep::new(Uuid::nil(), name, "prompt");
        s.result = result.map(str::to_owned);
        s
    }

    #[test]
    fn no_dependencies_means_no_context() {
        let a = step("a", Some("x"));
        assert_eq!(build_step_context(&[a.clone()], &a), None);
    }

    #[test]
    fn only_dependencies_with_results_contribute() {
        let a = step("a", Some("alpha"));
        let b = step("b", None);
        let mut c = step("c", None);
        c.depends_on = vec![a.id, b.id];
        let steps = vec![a, b, c.clone()];

        assert_eq!(
            build_step_context(&steps, &c).as_deref(),
            Some("Context from previous steps:\na: alpha")
        );
    }

    #[test]
    fn declared_order_is_kept() {
        let a = step("a", Some("1"));
        let b = step("b", Some("2"));
        let mut c = step("c", None);
        c.depends_on = vec![b.id, a.id];
        let steps = vec![a, b, c.clone()];

        assert_eq!(
            build_step_context(&steps, &c).as_deref(),
            Some("Context from previous steps:\nb: 2\na: 1")
        );
    }

    #[test]
    fn nothing_contributed_is_none() {
        let a = step("a", None);
        let mut c = step("c", None);
        c.depends_on = vec![a.id, Uuid::new_v4()];
        let steps = vec![a, c.clone()];

        assert_eq!(build_step_context(&steps, &c), None);
    }
}
