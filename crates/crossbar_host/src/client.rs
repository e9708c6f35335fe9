use std::process::Stdio;

use crate::{
    app,
    config::HostConfig,
    daemon_response::DaemonResponse,
    data_source::FallbackChain,
    ipc_server::RESPONSE_TIMEOUT,
    opts::{self, ActionClientOnly},
    paths::CrossbarPaths,
    render,
};
use anyhow::{Context, Result};
use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
};

pub fn handle_client_only_action(paths: &CrossbarPaths, action: ActionClientOnly) -> Result<()> {
    match action {
        ActionClientOnly::Logs => {
            std::process::Command::new("tail")
                .args(["-f", paths.get_log_file().to_string_lossy().as_ref()].iter())
                .stdin(Stdio::null())
                .spawn()?
                .wait()?;
        }
        ActionClientOnly::Stat { kind } => {
            let config = HostConfig::read_from_file(paths.get_config_file())?;
            println!("{}", FallbackChain::from_config(&config).read(kind));
        }
        ActionClientOnly::Once { json } => {
            let config = HostConfig::read_from_file(paths.get_config_file())?;
            let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().context("Failed to initialize tokio runtime")?;
            let payload = rt.block_on(app::render_once(&config, paths))?;
            if json {
                println!("{}", render::to_json(&payload)?);
            } else {
                println!("{}", render::to_text(&payload, &render::RenderOptions::from(&config)));
            }
        }
    }
    Ok(())
}

/// Connect to the daemon and send the given request.
/// Returns the response from the daemon, or None if the daemon did not provide any useful response. An Ok(None) response does _not_ indicate failure.
pub fn do_server_call(stream: &mut UnixStream, action: &opts::ActionWithServer) -> Result<Option<DaemonResponse>> {
    log::debug!("Forwarding options to server");
    stream.set_nonblocking(false).context("Failed to set stream to blocking")?;

    let message_bytes = bincode::serialize(&action)?;

    stream.write_all(&(message_bytes.len() as u32).to_be_bytes()).context("Failed to send command size header to IPC stream")?;

    stream.write_all(&message_bytes).context("Failed to write command to IPC stream")?;

    let mut buf = Vec::new();
    stream.set_read_timeout(Some(RESPONSE_TIMEOUT * 2)).context("Failed to set read timeout")?;
    stream.read_to_end(&mut buf).context("Error reading response from server")?;

    Ok(if buf.is_empty() {
        None
    } else {
        let buf = bincode::deserialize(&buf)?;
        Some(buf)
    })
}
