use crate::{CommandPlan, CommandSpec, CommandSpecError, extra_args, extra_env, optional_str, require_str};

/// Wraps `llama-server` (llama.cpp). Requires a `model` path; accepts free-form
/// `extra_args`/`env`.
pub struct LlamaCpp;

impl CommandSpec for LlamaCpp {
    fn build(&self, port: u16, options: &serde_json::Value) -> Result<CommandPlan, CommandSpecError> {
        let model = require_str(options, "model")?;

        let mut args = vec![
            "--model".to_string(),
            model.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];

        if let Some(ctx_size) = optional_str(options, "ctx_size") {
            args.push("--ctx-size".to_string());
            args.push(ctx_size.to_string());
        }

        args.extend(extra_args(options));

        Ok(CommandPlan {
            program: "llama-server".to_string(),
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
        let options = serde_json::json!({"model": "/models/llama.gguf"});
        let plan = LlamaCpp.build(20001, &options).unwrap();

        assert_eq!(plan.program, "llama-server");
        assert_eq!(plan.health_path, "/health");
        assert!(plan.args.windows(2).any(|w| w == ["--port", "20001"]));
        assert!(plan.args.windows(2).any(|w| w == ["--model", "/models/llama.gguf"]));
    }

    #[test]
    fn missing_model_is_an_error() {
        let options = serde_json::json!({});
        let err = LlamaCpp.build(20001, &options).unwrap_err();
        assert!(matches!(err, CommandSpecError::MissingOption("model")));
    }

    #[test]
    fn passes_through_extra_args() {
        let options = serde_json::json!({
            "model": "/m.gguf",
            "extra_args": ["--n-gpu-layers", "32"],
        });
        let plan = LlamaCpp.build(20001, &options).unwrap();
        assert!(plan.args.windows(2).any(|w| w == ["--n-gpu-layers", "32"]));
    }
}
