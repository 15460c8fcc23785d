use crate::{CommandPlan, CommandSpec, CommandSpecError, extra_args, extra_env, require_str};

/// Wraps `mlx_lm.server` (Apple MLX). Requires a `model` identifier (HF repo
/// id or local path).
pub struct MlxLm;

impl CommandSpec for MlxLm {
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
        args.extend(extra_args(options));

        Ok(CommandPlan {
            program: "mlx_lm.server".to_string(),
            args,
            env: extra_env(options),
            cwd: None,
            health_path: "/health".to_string(),
        })
    }
}
