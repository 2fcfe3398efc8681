//! OS system-proxy registration.
//!
//! Thin shell-outs per platform: `networksetup` on macOS, GNOME
//! `gsettings` on Linux, the WinINet registry on Windows. Platforms
//! without these tools report `supported = false` rather than failing.

use serde::Serialize;
use tokio::process::Command;

#[derive(Debug, Clone, Serialize)]
pub struct SystemProxyState {
    pub supported: bool,
    pub enabled: bool,
    pub os: &'static str,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub bypass: Vec<String>,
}

impl SystemProxyState {
    fn unsupported() -> Self {
        Self {
            supported: false,
            enabled: false,
            os: std::env::consts::OS,
            host: None,
            port: None,
            bypass: Vec::new(),
        }
    }
}

async fn run(program: &str, args: &[&str]) -> Result<String, String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", program, e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(detail.trim().to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub async fn status() -> Result<SystemProxyState, String> {
    match std::env::consts::OS {
        "macos" => macos::status().await,
        "linux" => linux::status().await,
        "windows" => windows::status().await,
        _ => Ok(SystemProxyState::unsupported()),
    }
}

pub async fn enable(host: &str, port: u16) -> Result<SystemProxyState, String> {
    match std::env::consts::OS {
        "macos" => macos::enable(host, port).await,
        "linux" => linux::enable(host, port).await,
        "windows" => windows::enable(host, port).await,
        _ => Ok(SystemProxyState::unsupported()),
    }
}

pub async fn disable() -> Result<SystemProxyState, String> {
    match std::env::consts::OS {
        "macos" => macos::disable().await,
        "linux" => linux::disable().await,
        "windows" => windows::disable().await,
        _ => Ok(SystemProxyState::unsupported()),
    }
}

mod macos {
    use super::*;

    async fn services() -> Result<Vec<String>, String> {
        let output = run("networksetup", &["-listallnetworkservices"]).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('*') && !line.starts_with("An asterisk"))
            .map(str::to_string)
            .collect())
    }

    pub async fn status() -> Result<SystemProxyState, String> {
        let mut state = SystemProxyState {
            supported: true,
            enabled: false,
            os: "macos",
            host: None,
            port: None,
            bypass: Vec::new(),
        };
        for service in services().await? {
            let output = run("networksetup", &["-getwebproxy", &service]).await?;
            let mut enabled = false;
            for line in output.lines() {
                let Some((key, value)) = line.split_once(':') else {
                    continue;
                };
                match key.trim().to_ascii_lowercase().as_str() {
                    "enabled" => enabled = value.trim().eq_ignore_ascii_case("yes"),
                    "server" => state.host = Some(value.trim().to_string()),
                    "port" => state.port = value.trim().parse().ok(),
                    _ => {}
                }
            }
            if enabled {
                state.enabled = true;
                break;
            }
        }
        Ok(state)
    }

    pub async fn enable(host: &str, port: u16) -> Result<SystemProxyState, String> {
        let port_str = port.to_string();
        for service in services().await? {
            run("networksetup", &["-setwebproxy", &service, host, &port_str]).await?;
            run("networksetup", &["-setsecurewebproxy", &service, host, &port_str]).await?;
            run("networksetup", &["-setwebproxystate", &service, "on"]).await?;
            run("networksetup", &["-setsecurewebproxystate", &service, "on"]).await?;
        }
        Ok(SystemProxyState {
            supported: true,
            enabled: true,
            os: "macos",
            host: Some(host.to_string()),
            port: Some(port),
            bypass: Vec::new(),
        })
    }

    pub async fn disable() -> Result<SystemProxyState, String> {
        for service in services().await? {
            run("networksetup", &["-setwebproxystate", &service, "off"]).await?;
            run("networksetup", &["-setsecurewebproxystate", &service, "off"]).await?;
        }
        Ok(SystemProxyState {
            supported: true,
            enabled: false,
            os: "macos",
            host: None,
            port: None,
            bypass: Vec::new(),
        })
    }
}

mod linux {
    use super::*;

    pub async fn status() -> Result<SystemProxyState, String> {
        let Ok(mode) = run("gsettings", &["get", "org.gnome.system.proxy", "mode"]).await else {
            return Ok(SystemProxyState::unsupported());
        };
        let enabled = mode.contains("manual");
        let host = run("gsettings", &["get", "org.gnome.system.proxy.http", "host"])
            .await
            .ok()
            .map(|h| h.trim_matches('\'').to_string())
            .filter(|h| !h.is_empty());
        let port = run("gsettings", &["get", "org.gnome.system.proxy.http", "port"])
            .await
            .ok()
            .and_then(|p| p.parse().ok());
        Ok(SystemProxyState {
            supported: true,
            enabled,
            os: "linux",
            host,
            port,
            bypass: Vec::new(),
        })
    }

    pub async fn enable(host: &str, port: u16) -> Result<SystemProxyState, String> {
        let port_str = port.to_string();
        run("gsettings", &["set", "org.gnome.system.proxy.http", "host", host]).await?;
        run("gsettings", &["set", "org.gnome.system.proxy.http", "port", &port_str]).await?;
        run("gsettings", &["set", "org.gnome.system.proxy.https", "host", host]).await?;
        run("gsettings", &["set", "org.gnome.system.proxy.https", "port", &port_str]).await?;
        run("gsettings", &["set", "org.gnome.system.proxy", "mode", "manual"]).await?;
        Ok(SystemProxyState {
            supported: true,
            enabled: true,
            os: "linux",
            host: Some(host.to_string()),
            port: Some(port),
            bypass: Vec::new(),
        })
    }

    pub async fn disable() -> Result<SystemProxyState, String> {
        run("gsettings", &["set", "org.gnome.system.proxy", "mode", "none"]).await?;
        Ok(SystemProxyState {
            supported: true,
            enabled: false,
            os: "linux",
            host: None,
            port: None,
            bypass: Vec::new(),
        })
    }
}

mod windows {
    use super::*;

    const KEY: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

    pub async fn status() -> Result<SystemProxyState, String> {
        let Ok(output) = run("reg", &["query", KEY, "/v", "ProxyEnable"]).await else {
            return Ok(SystemProxyState::unsupported());
        };
        let enabled = output.contains("0x1");
        let server = run("reg", &["query", KEY, "/v", "ProxyServer"])
            .await
            .ok()
            .and_then(|out| out.split_whitespace().last().map(str::to_string));
        let (host, port) = match server.as_deref().and_then(|s| s.rsplit_once(':')) {
            Some((h, p)) => (Some(h.to_string()), p.parse().ok()),
            None => (server, None),
        };
        Ok(SystemProxyState {
            supported: true,
            enabled,
            os: "windows",
            host,
            port,
            bypass: Vec::new(),
        })
    }

    pub async fn enable(host: &str, port: u16) -> Result<SystemProxyState, String> {
        let server = format!("{}:{}", host, port);
        run(
            "reg",
            &["add", KEY, "/v", "ProxyServer", "/t", "REG_SZ", "/d", &server, "/f"],
        )
        .await?;
        run(
            "reg",
            &["add", KEY, "/v", "ProxyEnable", "/t", "REG_DWORD", "/d", "1", "/f"],
        )
        .await?;
        Ok(SystemProxyState {
            supported: true,
            enabled: true,
            os: "windows",
            host: Some(host.to_string()),
            port: Some(port),
            bypass: Vec::new(),
        })
    }

    pub async fn disable() -> Result<SystemProxyState, String> {
        run(
            "reg",
            &["add", KEY, "/v", "ProxyEnable", "/t", "REG_DWORD", "/d", "0", "/f"],
        )
        .await?;
        Ok(SystemProxyState {
            supported: true,
            enabled: false,
            os: "windows",
            host: None,
            port: None,
            bypass: Vec::new(),
        })
    }
}
