fn main() {
    // Load .env file for WiFi and broker configuration
    load_env_config();

    // Host builds (unit and scenario tests) link normally
    if std::env::var_os("CARGO_FEATURE_ESP32C3").is_some() {
        linker_be_nice();
        // make sure linkall.x is the last linker script (otherwise might cause problems with flip-link)
        println!("cargo:rustc-link-arg=-Tlinkall.x");
    }
}

/// Compile-time settings and their fallbacks when neither the environment nor .env sets them
const SETTINGS: &[(&str, &str)] = &[
    ("WIFI_SSID", ""),
    ("WIFI_PASSWORD", ""),
    ("MQTT_BROKER_HOST", "192.168.1.100"),
    ("MQTT_BROKER_PORT", "1883"),
    ("MQTT_USERNAME", ""),
    ("MQTT_PASSWORD", ""),
];

/// Load environment configuration from .env file
/// Environment variables take priority over .env file values
fn load_env_config() {
    use std::env;
    use std::path::Path;

    // Tell cargo to rerun this build script if .env file changes
    println!("cargo:rerun-if-changed=.env");

    for (name, _) in SETTINGS {
        println!("cargo:rerun-if-env-changed={}", name);
    }

    // Try to load .env file if it exists
    if Path::new(".env").exists() {
        match dotenvy::dotenv() {
            Ok(_) => println!("cargo:warning=Loaded .env file"),
            Err(e) => println!("cargo:warning=Failed to load .env file: {}", e),
        }
    }

    // Note: We need to handle the case where env vars are set to empty strings
    for (name, fallback) in SETTINGS {
        let value = env::var(name)
            .map(|v| v.trim().to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.to_string());

        println!("cargo:rustc-env={}={}", name, value);

        let secret = name.ends_with("PASSWORD");
        if value.is_empty() {
            println!("cargo:warning={} is empty", name);
        } else if secret {
            println!("cargo:warning={} configured (length: {})", name, value.len());
        } else {
            println!("cargo:warning={} configured: {}", name, value);
        }
    }

    // The port is parsed with `u16::from_str_radix` at compile time, reject junk early
    if let Ok(port) = env::var("MQTT_BROKER_PORT") {
        if !port.trim().is_empty() && port.trim().parse::<u16>().is_err() {
            panic!("MQTT_BROKER_PORT must be a number, got {:?}", port);
        }
    }
}

fn linker_be_nice() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        let kind = &args[1];
        let what = &args[2];

        match kind.as_str() {
            "undefined-symbol" => match what.as_str() {
                "_stack_start" => {
                    eprintln!();
                    eprintln!("💡 Is the linker script `linkall.x` missing?");
                    eprintln!();
                }
                "esp_wifi_preempt_enable"
                | "esp_wifi_preempt_yield_task"
                | "esp_wifi_preempt_task_create" => {
                    eprintln!();
                    eprintln!("💡 `esp-wifi` has no scheduler enabled. Make sure you have the `builtin-scheduler` feature enabled, or that you provide an external scheduler.");
                    eprintln!();
                }
                _ => (),
            },
            // we don't have anything helpful for "missing-lib" yet
            _ => {
                std::process::exit(1);
            }
        }

        std::process::exit(0);
    }

    println!(
        "cargo:rustc-link-arg=--error-handling-script={}",
        std::env::current_exe().unwrap().display()
    );
}
