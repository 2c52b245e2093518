//! Command-line surface of the server binary.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{ClassQuotas, ServerConfig};
use crate::recipe::OptionValue;

#[derive(Debug, Parser)]
#[command(name = "modeld", version, about = "Local inference server")]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Host or address to bind.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: String,

    /// Server-scope default context size for recipes that accept one.
    #[arg(long)]
    pub ctx_size: Option<i64>,

    /// Server-scope llama.cpp backend flavor (vulkan, cpu, ...).
    #[arg(long)]
    pub llamacpp_backend: Option<String>,

    /// Extra arguments appended to every llama.cpp backend invocation.
    #[arg(long)]
    pub llamacpp_args: Option<String>,

    /// Per-class load quotas, e.g. llm=2,embedding=1,reranking=1,audio=1.
    #[arg(long, value_name = "SPEC")]
    pub max_loaded_models: Option<ClassQuotas>,

    /// Secondary directory scanned for local GGUF model files at startup.
    #[arg(long, value_name = "PATH")]
    pub extra_models_dir: Option<PathBuf>,

    /// Directory for the rotating server log (enables /logs/stream).
    #[arg(long, value_name = "PATH")]
    pub log_dir: Option<PathBuf>,

    /// Override the platform cache root holding models and catalog state.
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,
}

impl Cli {
    pub fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig {
            host: self.host,
            port: self.port,
            log_level: self.log_level,
            extra_models_dir: self.extra_models_dir,
            log_dir: self.log_dir,
            ..ServerConfig::default()
        };
        if let Some(cache_dir) = self.cache_dir {
            config.cache_root = cache_dir;
        }
        if let Some(quotas) = self.max_loaded_models {
            config.quotas = quotas;
        }
        if let Some(ctx_size) = self.ctx_size {
            config.set_server_option("ctx_size", OptionValue::Int(ctx_size));
        }
        if let Some(backend) = self.llamacpp_backend {
            config.set_server_option("llamacpp_backend", OptionValue::Text(backend));
        }
        if let Some(args) = self.llamacpp_args {
            config.set_server_option("llamacpp_args", OptionValue::Text(args));
        }
        config
    }
}
