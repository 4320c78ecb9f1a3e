/// Logs a deployment hint for running as a supervised service on this
/// platform. Purely informational; the binary itself is supervisor-agnostic.
pub fn log_platform_guidance() {
    #[cfg(windows)]
    {
        tracing::info!(
            "run under a service wrapper such as NSSM: nssm install weighbridge \
             weighbridge.exe --config C:\\etc\\weighbridge\\weighbridge.toml"
        );
    }

    #[cfg(not(windows))]
    {
        const TEMPLATE: &str = r#"[Unit]
Description=Weighbridge serial-to-HTTP gateway
After=network.target

[Service]
ExecStart=/usr/local/bin/weighbridge --config /etc/weighbridge/weighbridge.toml
Restart=on-failure

[Install]
WantedBy=multi-user.target
"#;

        tracing::info!(template = TEMPLATE, "systemd unit template available");
    }
}
