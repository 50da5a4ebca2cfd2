use anyhow::Context;
use clap::Subcommand;
use hostforge_core::stages::wireguard;
use qrcode::{render::unicode, QrCode};
use std::path::Path;

#[derive(Subcommand)]
pub enum VpnSubcommand {
    /// Print the client profile as a QR code for the WireGuard mobile app
    ClientQr {
        /// Client name (defaults to VPN_CLIENT_NAME)
        #[arg(long)]
        name: Option<String>,
    },
}

pub fn run(config_path: &Path, subcmd: VpnSubcommand) -> anyhow::Result<()> {
    match subcmd {
        VpnSubcommand::ClientQr { name } => client_qr(config_path, name),
    }
}

fn client_qr(config_path: &Path, name: Option<String>) -> anyhow::Result<()> {
    let name = match name {
        Some(n) => n,
        None => super::load_or_scaffold(config_path)?.vpn.client_name,
    };
    let path = wireguard::client_config_path(&name);
    let profile = std::fs::read_to_string(&path).with_context(|| {
        format!("cannot read {path}: run the wireguard stage first (as root)")
    })?;

    let code = QrCode::new(profile.as_bytes()).context("client profile too large for a QR code")?;
    let image = code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Dark)
        .light_color(unicode::Dense1x2::Light)
        .build();

    println!();
    println!("  WireGuard client '{name}' ({path})");
    println!();
    for line in image.lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}
