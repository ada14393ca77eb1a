use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    time::timeout,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{
        QUIT_COMMAND, USERNAME_ACCEPTED, USERNAME_TAKEN, decode_datagram, read_line, write_line,
    },
};

/// How long a datagram client waits for the registration reply.
const DATAGRAM_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(args: ClientArgs) -> Result<()> {
    if args.udp {
        run_datagram(&args).await
    } else {
        run_stream(&args).await
    }
}

/// What a line typed on stdin asks for.
enum Input<'a> {
    Eof,
    Blank,
    Quit,
    Text(&'a str),
}

fn parse_input(bytes_read: io::Result<usize>, input: &str) -> io::Result<Input<'_>> {
    if bytes_read? == 0 {
        return Ok(Input::Eof);
    }

    let text = input.trim_end();
    if text.is_empty() {
        Ok(Input::Blank)
    } else if text.eq_ignore_ascii_case(QUIT_COMMAND) {
        Ok(Input::Quit)
    } else {
        Ok(Input::Text(text))
    }
}

fn check_registration_reply(reply: &str, username: &str) -> Result<()> {
    match reply {
        USERNAME_ACCEPTED => Ok(()),
        USERNAME_TAKEN => bail!("username '{username}' was rejected by the server"),
        other => bail!("unexpected registration reply: {other}"),
    }
}

async fn run_stream(args: &ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(args.server).await?;

    write_line(&mut writer, &args.username)
        .await
        .context("failed to send username")?;
    let reply = read_line(&mut reader)
        .await?
        .context("server closed the connection during registration")?;
    check_registration_reply(&reply, &args.username)?;
    write_stdout(&format!("*** connected as {}", args.username)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_stream_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    server: SocketAddr,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;

    info!("connected to {}", server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn run_stream_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    let mut lines = reader.lines();
    loop {
        input.clear();
        select! {
            server_line = lines.next_line() => {
                match server_line? {
                    Some(line) => write_stdout(&line).await?,
                    None => {
                        write_stdout("*** server closed the connection").await?;
                        break;
                    }
                }
            }
            bytes_read = stdin.read_line(input) => {
                match parse_input(bytes_read, input)? {
                    Input::Eof => break,
                    Input::Blank => {}
                    Input::Quit => {
                        write_stdout("*** leaving chat").await?;
                        write_line(writer, QUIT_COMMAND).await?;
                        break;
                    }
                    Input::Text(text) => write_line(writer, text).await?,
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn run_datagram(args: &ClientArgs) -> Result<()> {
    let socket = bind_datagram(args.server).await?;

    socket
        .send(args.username.as_bytes())
        .await
        .context("failed to send username")?;

    let mut buf = vec![0u8; 65_535];
    let len = timeout(DATAGRAM_REPLY_TIMEOUT, socket.recv(&mut buf))
        .await
        .context("no registration reply from server")?
        .context("failed to read registration reply")?;
    check_registration_reply(&decode_datagram(&buf[..len]), &args.username)?;
    write_stdout(&format!("*** connected as {}", args.username)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            received = socket.recv(&mut buf) => {
                match received {
                    Ok(len) => write_stdout(&decode_datagram(&buf[..len])).await?,
                    Err(error) => {
                        warn!(?error, "datagram receive failed");
                        write_stdout("*** server unreachable").await?;
                        break;
                    }
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                match parse_input(bytes_read, &input)? {
                    Input::Eof => break,
                    Input::Blank => {}
                    Input::Quit => {
                        write_stdout("*** leaving chat").await?;
                        socket.send(QUIT_COMMAND.as_bytes()).await?;
                        break;
                    }
                    Input::Text(text) => {
                        socket.send(text.as_bytes()).await?;
                    }
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    Ok(())
}

/// Binds an ephemeral socket of the server's address family and connects
/// it so only the server's datagrams are received.
async fn bind_datagram(server: SocketAddr) -> Result<UdpSocket> {
    let local: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local)
        .await
        .context("failed to bind datagram socket")?;
    socket
        .connect(server)
        .await
        .with_context(|| format!("failed to connect datagram socket to {server}"))?;
    info!("sending datagrams to {}", server);
    Ok(socket)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_lines_are_classified() {
        assert!(matches!(parse_input(Ok(0), ""), Ok(Input::Eof)));
        assert!(matches!(parse_input(Ok(1), "\n"), Ok(Input::Blank)));
        assert!(matches!(parse_input(Ok(6), "/QUIT\n"), Ok(Input::Quit)));
        assert!(matches!(parse_input(Ok(3), "hi\n"), Ok(Input::Text("hi"))));
    }

    #[test]
    fn registration_replies() {
        assert!(check_registration_reply(USERNAME_ACCEPTED, "alice").is_ok());
        let rejected = check_registration_reply(USERNAME_TAKEN, "alice").unwrap_err();
        assert!(rejected.to_string().contains("alice"));
        assert!(check_registration_reply("HELLO", "alice").is_err());
    }
}
