use anyhow::{Context, Result};
use secrecy::SecretString;

use crate::api::ServerConfig;
use crate::cli::{
    actions::{server, Action},
    commands,
};
use crate::password::HasherConfig;

/// Build the [`Action`] from parsed arguments.
///
/// # Errors
/// Returns an error when a required argument is missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .context("missing required argument: --port")?;
    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let amqp_url = matches
        .get_one::<String>(commands::ARG_AMQP_URL)
        .cloned()
        .context("missing required argument: --amqp-url")?;
    let master_key_path = matches
        .get_one::<String>(commands::ARG_MASTER_KEY_PATH)
        .cloned()
        .context("missing required argument: --master-key-path")?
        .into();
    let token_secret = matches
        .get_one::<String>(commands::ARG_TOKEN_SECRET)
        .cloned()
        .map(SecretString::from)
        .context("missing required argument: --token-secret")?;
    let session_ttl_seconds = matches
        .get_one::<i64>(commands::ARG_SESSION_TTL)
        .copied()
        .context("missing required argument: --session-ttl-seconds")?;

    let hasher = HasherConfig {
        memory_kib: matches
            .get_one::<u32>(commands::ARG_ARGON2_MEMORY)
            .copied()
            .unwrap_or(65536),
        iterations: matches
            .get_one::<u32>(commands::ARG_ARGON2_ITERATIONS)
            .copied()
            .unwrap_or(3),
        parallelism: matches
            .get_one::<u32>(commands::ARG_ARGON2_PARALLELISM)
            .copied()
            .unwrap_or(4),
    };

    Ok(Action::Run(Box::new(server::Args {
        config: ServerConfig {
            port,
            dsn,
            amqp_url,
            master_key_path,
            token_secret,
            session_ttl_seconds,
            hasher,
            release_mode: matches.get_flag(commands::ARG_RELEASE),
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_builds_server_action() {
        let matches = commands::new().get_matches_from(vec![
            "fieldlock",
            "--dsn",
            "postgres://fieldlock@localhost/fieldlock",
            "--port",
            "9001",
            "--release",
        ]);
        let action = handler(&matches).expect("handler");
        let Action::Run(args) = action;
        assert_eq!(args.config.port, 9001);
        assert!(args.config.release_mode);
        assert_eq!(args.config.session_ttl_seconds, 28800);
        assert_eq!(args.config.hasher.memory_kib, 65536);
    }
}
