use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "llama backend supervisor")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<String>,

    /// Sub‑commands (run, status, prompt)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Supervise all backends (default if no sub‑command).
    /// UI commands are read as JSON lines on stdin, events written to stdout.
    Run,
    /// Probe every configured service port (Exit 0 = inference up, 1 = down)
    Status,
    /// Send one prompt to a running inference server and stream the reply
    Prompt {
        /// Prompt text
        text: String,

        /// Seconds to wait for the connection
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },
}
