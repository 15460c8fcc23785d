use crate::{CommandPlan, CommandSpec, CommandSpecError, extra_args, extra_env, optional_str, require_str};

/// Wraps `vllm serve`. Requires a `model` identifier; `served_model_name`
/// controls the name the OpenAI-compatible API reports back.
pub struct Vllm;

impl CommandSpec for Vllm {
    fn build(&self, port: u16, options: &serde_json::Value) -> Result<CommandPlan, CommandSpecError> {
        let model = require_str(options, "model")?;

        let mut args = vec![
            "serve".to_string(),
            model.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];

        if let Some(served_name) = optional_str(options, "served_model_name") {
            args.push("--served-model-name".to_string());
            args.push(served_name.to_string());
        }

        args.extend(extra_args(options));

        Ok(CommandPlan {
            program: "vllm".to_string(),
            args,
            env: extra_env(options),
            cwd: None,
            health_path: "/health".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_minimal_command() {
        let options = serde_json::json!({"model": "meta-llama/Llama-3-8B"});
        let plan = Vllm.build(20020, &options).unwrap();

        assert_eq!(plan.program, "vllm");
        assert_eq!(plan.args[0], "serve");
        assert!(plan.args.windows(2).any(|w| w == ["--port", "20020"]));
    }

    #[test]
    fn includes_served_model_name_when_present() {
        let options = serde_json::json!({
            "model": "meta-llama/Llama-3-8B",
            "served_model_name": "llama3",
        });
        let plan = Vllm.build(20020, &options).unwrap();
        assert!(plan.args.windows(2).any(|w| w == ["--served-model-name", "llama3"]));
    }

    #[test]
    fn missing_model_is_an_error() {
        let err = Vllm.build(20020, &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, CommandSpecError::MissingOption("model")));
    }
}
