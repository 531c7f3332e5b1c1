use arkiv_model::ArchiveFilter;
use arkiv_server::{config, http, shutdown};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match config::ServerConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };
    if config.dev_mode {
        tracing::warn!("DEV context active, source \"test\" requests bypass token validation");
    }

    let state = match http::build_state(config.clone()).await {
        Ok(state) => state,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let app = http::router(state.clone());

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(_) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED failed to bind archive listener");
            std::process::exit(1);
        }
    };

    tracing::info!(bind_addr = %config.bind_addr, "sf-arkiv listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
            std::process::exit(1);
        }
    });

    if let Err(err) = self_test(&state).await {
        eprintln!("STARTUP_ERROR {}", err);
        std::process::exit(1);
    }

    shutdown::schedule_daily_restart(state.alive.clone(), config.shutdown_hour);

    let _ = server.await;
}

/// Boot probe against the live schema: runs the reference fetch and lists
/// the schema's tables. Any failure aborts startup.
async fn self_test(state: &http::AppState) -> Result<(), config::StartupError> {
    let probe = ArchiveFilter {
        subject_person_id: "22222".to_string(),
        ..ArchiveFilter::default()
    };
    let query = probe.to_query().map_err(|err| config::StartupError {
        code: "ERR_SELF_TEST",
        message: format!("self-test filter rejected: {err}"),
    })?;

    let rows = state
        .store
        .fetch_archive(&query)
        .await
        .map_err(|err| config::StartupError {
            code: "ERR_SELF_TEST",
            message: format!("self-test fetch failed: {err}"),
        })?;
    tracing::info!(rows = rows.len(), "self-test fetch completed");

    let tables = state
        .store
        .list_tables()
        .await
        .map_err(|err| config::StartupError {
            code: "ERR_SELF_TEST",
            message: format!("self-test table listing failed: {err}"),
        })?;
    tracing::info!(?tables, "schema tables");

    Ok(())
}
