use super::error::SpecError;
use super::workflow::WorkflowSpec;

/// Parses a structured workflow document (YAML or JSON) and validates it.
///
/// The out-of-scope REST surface and CLI both funnel through here so there
/// is exactly one place that turns "untrusted bytes" into a validated
/// [`WorkflowSpec`]; the engine proper never sees anything but the latter.
pub fn parse_workflow_spec(document: &str) -> Result<WorkflowSpec, SpecError> {
    let spec: WorkflowSpec = serde_yaml::from_str(document)
        .map_err(|e| SpecError::Other(format!("failed to parse workflow document: {e}")))?;
    spec.validate()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
version: "1.0"
name: greet
type: direct
start-task: say_hi
tasks:
  say_hi:
    action: std.echo
    publish:
      greeting: "'Hi'"
  say_bye:
    action: std.echo
"#;

    #[test]
    fn parses_and_validates() {
        let spec = parse_workflow_spec(VALID).unwrap();
        assert_eq!(spec.name, "greet");
        assert_eq!(spec.tasks.len(), 2);
    }

    #[test]
    fn round_trips_through_serialize() {
        let spec = parse_workflow_spec(VALID).unwrap();
        let serialized = serde_yaml::to_string(&spec).unwrap();
        let reparsed = parse_workflow_spec(&serialized).unwrap();
        assert_eq!(spec, reparsed);
    }

    #[test]
    fn rejects_unknown_start_task() {
        let doc = VALID.replacen("start-task: say_hi", "start-task: nonexistent", 1);
        assert!(parse_workflow_spec(&doc).is_err());
    }
}
