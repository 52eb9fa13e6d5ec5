use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::path::PathBuf;

/// Builds the Postgres connection string. `DATABASE_URL` wins when set;
/// otherwise the URL is assembled from `POSTGRES_*` parts, which is how the
/// containerized deployment passes credentials.
pub fn postgres_url_from_environment() -> String {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.is_empty() {
            return url;
        }
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct PostgresConfig {
        user: String,
        password: Option<String>,
        password_file: Option<PathBuf>,
        host: Option<String>,
        db: String,
    }
    let provider = figment::providers::Env::prefixed("POSTGRES_");
    let postgres_config: PostgresConfig = figment::Figment::from(provider)
        .extract()
        .expect("DATABASE_URL or POSTGRES_* environment variable(s) missing or invalid");

    let password = if let Some(password) = postgres_config.password {
        password
    } else if let Some(password_file) = postgres_config.password_file {
        std::fs::read_to_string(password_file).expect("Failed to read postgres password file")
    } else {
        panic!("One of POSTGRES_PASSWORD or POSTGRES_PASSWORD_FILE must be provided");
    };

    // A trailing newline is almost always an artifact of how the secret file
    // was written; any other newline would be silently truncated by Postgres,
    // so refuse it outright.
    let password = password.strip_suffix("\n").unwrap_or(&password);
    if password.contains("\n") {
        panic!(
            "Postgres password contains a non-terminal newline. This password would be \
            insecurely truncated. Please try again with a password that does not contain \
            non-terminal newlines."
        );
    }

    // Must percent encode the password; the encoder's output implements
    // Display so it can go straight into the format.
    let password = utf8_percent_encode(password, NON_ALPHANUMERIC);
    let host = postgres_config.host.as_deref().unwrap_or("db");

    format!(
        "postgres://{}:{}@{}/{}",
        postgres_config.user, password, host, postgres_config.db
    )
}
