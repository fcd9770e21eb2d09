#![no_main]

use libfuzzer_sys::fuzz_target;
use pgbackup_connect::ConnectionConfig;

fuzz_target!(|data: &str| {
    if let Ok(config) = ConnectionConfig::parse_with_env(data, |_| None) {
        // Anything parsing accepts must also pass validation
        assert!(config.validate().is_ok());
        assert!(config.origin().is_trusted());
    }
});
