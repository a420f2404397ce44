//! Configuration loaded from a `.env` file, the way `main` does it.

use std::io::Write;
use std::time::Duration;

use collab_server::ServerConfig;

#[test]
fn test_dotenv_file_feeds_server_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "BIND_ADDR=127.0.0.1:4321").unwrap();
    writeln!(file, "BACKEND_URL=http://documents.internal:3000/").unwrap();
    writeln!(file, "BACKEND_API_TOKEN=secret-token").unwrap();
    writeln!(file, "SAVE_DEBOUNCE_MS=750").unwrap();
    writeln!(file, "GC_DELAY_MS=5000").unwrap();
    writeln!(file, "SSH_CONNECT_TIMEOUT_SECS=7").unwrap();
    drop(file);

    dotenv::from_path(&path).unwrap();
    let config = ServerConfig::from_env().unwrap();

    assert_eq!(config.bind_addr, "127.0.0.1:4321");
    assert_eq!(config.backend_url, "http://documents.internal:3000");
    assert_eq!(config.backend_api_token.as_deref(), Some("secret-token"));
    assert_eq!(config.save_debounce, Duration::from_millis(750));
    assert_eq!(config.gc_delay, Duration::from_secs(5));
    assert_eq!(config.ssh_connect_timeout, Duration::from_secs(7));
    assert_eq!(config.save_max_debounce, ServerConfig::default().save_max_debounce);
}
