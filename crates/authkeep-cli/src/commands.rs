use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use authkeep_core::{GuardedAccess, SessionManager, SessionPhase};

pub const USAGE: &str = "\
Usage: authkeep <command>

Commands:
  status          Show the session state and who is signed in
  login [email]   Sign in with email and password
  token           Print a valid access token, refreshing if needed
  headers         Print the headers an API request would carry
  guard           Check whether a protected view may be shown
  logout          Sign out and revoke the server session
  help            Show this message

Environment:
  AUTHKEEP_API_URL   API base URL (overrides config.json)
  AUTHKEEP_STORAGE   Credential storage: file, keyring, or memory
  AUTHKEEP_LOG_DIR   Also write daily log files to this directory
  RUST_LOG           Log filter (default: warn)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Login { email: Option<String> },
    Token,
    Headers,
    Guard,
    Logout,
    Help,
}

impl Command {
    pub fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let Some(name) = args.next() else {
            return Ok(Command::Status);
        };

        let command = match name.as_str() {
            "status" => Command::Status,
            "login" => Command::Login { email: args.next() },
            "token" => Command::Token,
            "headers" => Command::Headers,
            "guard" => Command::Guard,
            "logout" => Command::Logout,
            "help" | "-h" | "--help" => Command::Help,
            other => bail!("Unknown command: {}", other),
        };

        if let Some(extra) = args.next() {
            bail!("Unexpected argument: {}", extra);
        }
        Ok(command)
    }
}

/// Exit status for a guard check that did not allow access.
pub const ACCESS_DENIED_EXIT: u8 = 1;

/// Run one command. The returned status becomes the process exit code, so
/// `main` can unwind normally and flush its log writer.
pub async fn run(command: Command, session: Arc<SessionManager>) -> Result<u8> {
    let state = session.initialize().await;
    debug!(phase = state.phase.as_str(), "Session initialized");

    match command {
        Command::Status => {
            println!("Session: {}", state.phase.as_str());
            if let Some(user) = session.current_user() {
                println!("User:    {} ({})", user.display_name(), user.id);
            }
            if let Some(record) = session.tokens().record().await {
                match record.expiry {
                    Some(expiry) => println!("Expires: {}", expiry),
                    None => println!("Expires: unknown"),
                }
            }
        }

        Command::Login { email } => {
            let email = match email {
                Some(email) => email,
                None => prompt("Email: ")?,
            };
            let password =
                rpassword::prompt_password("Password: ").context("Failed to read password")?;

            match session.sign_in_with_password(&email, &password).await {
                Ok(_) => match session.current_user() {
                    Some(user) => println!("Signed in as {}", user.display_name()),
                    None => println!("Signed in"),
                },
                Err(e) => bail!(e.user_message()),
            }
        }

        Command::Token => {
            let token = session
                .tokens()
                .get_valid_token()
                .await
                .ok_or_else(|| anyhow!("Not signed in"))?;
            println!("{}", token);
        }

        Command::Headers => {
            let headers = session.tokens().auth_headers().await;
            for (name, value) in headers.iter() {
                println!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
            }
        }

        Command::Guard => {
            let decision = GuardedAccess::new(Arc::clone(&session)).can_proceed().await;
            println!("{}", describe_decision(decision.allowed, decision.redirect_target.as_deref()));
            if !decision.allowed {
                return Ok(ACCESS_DENIED_EXIT);
            }
        }

        Command::Logout => {
            if state.phase != SessionPhase::Authenticated {
                debug!("No active session, clearing local credentials anyway");
            }
            let failures = session.sign_out().await.join().await;
            for failure in &failures {
                eprintln!("Warning: {} failed: {}", failure.task, failure.error);
            }
            println!("Signed out");
        }

        Command::Help => println!("{}", USAGE),
    }

    Ok(0)
}

fn prompt(label: &str) -> Result<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{}", label)?;
    stdout.flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("No {} given", label.trim_end_matches(": ").to_lowercase());
    }
    Ok(value)
}

fn describe_decision(allowed: bool, redirect: Option<&str>) -> String {
    match redirect {
        Some(target) => format!("allowed={} redirect={}", allowed, target),
        None if allowed => "allowed=true".to_string(),
        None => "allowed=false (still loading)".to_string(),
    }
}
