//! Control-channel client backing `keywarp msg`.

use anyhow::{bail, Context};
use keywarp_ipc::{Message, MessageType, Socket};

use crate::cli::Msg;

pub fn handle_msg(msg: Msg) -> anyhow::Result<()> {
    match msg {
        Msg::Reload => request(Message::new(MessageType::Reload)),
        Msg::Bind { expr } => request(Message::with_text(MessageType::Bind, &expr)),
        Msg::Listen => listen(),
    }
}

fn connect() -> anyhow::Result<Socket> {
    Socket::connect().context("error connecting to the keywarp socket (is the daemon running?)")
}

fn request(request: Message) -> anyhow::Result<()> {
    let reply = connect()?
        .send_request(request)
        .context("error communicating with the daemon")?;

    match reply.ty {
        MessageType::Success => {
            println!("{}", reply.text());
            Ok(())
        }
        MessageType::Fail => bail!("{}", reply.text()),
        _ => bail!("unexpected reply type {:?}", reply.ty),
    }
}

fn listen() -> anyhow::Result<()> {
    let stream = connect()?
        .subscribe_layers()
        .context("error subscribing to layer changes")?;

    for record in stream {
        let (name, active) = record.context("error reading the layer stream")?;
        println!("{}{name}", if active { '+' } else { '-' });
    }

    Ok(())
}
