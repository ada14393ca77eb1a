use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Reply sent to a client whose username was registered.
pub const USERNAME_ACCEPTED: &str = "USERNAME_ACCEPTED";
/// Reply sent to a client whose username is empty or already in use.
pub const USERNAME_TAKEN: &str = "USERNAME_TAKEN";
/// Chat text that asks the server to drop the sender's registration.
pub const QUIT_COMMAND: &str = "/quit";

/// Where a message entered this server instance.
///
/// The broadcaster keys both of its rules off this value: a `Client` origin
/// is excluded from its own fan-out, and a `Peer` origin is never written
/// back to the peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A client registered on this instance.
    Client(String),
    /// Generated by this instance rather than any client.
    Server,
    /// A line received over the peer link.
    Peer,
}

impl Origin {
    pub fn is_client(&self, username: &str) -> bool {
        matches!(self, Origin::Client(name) if name == username)
    }

    pub fn forwards_to_peer(&self) -> bool {
        !matches!(self, Origin::Peer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Chat { username: String, text: String },
    Joined { username: String },
    Left { username: String },
    /// A line the sibling instance already formatted.
    Relayed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub origin: Origin,
    pub body: Body,
}

impl Message {
    pub fn chat(username: &str, text: impl Into<String>) -> Self {
        Self {
            origin: Origin::Client(username.to_string()),
            body: Body::Chat {
                username: username.to_string(),
                text: text.into(),
            },
        }
    }

    /// The joiner is the origin so they do not see their own arrival.
    pub fn joined(username: &str) -> Self {
        Self {
            origin: Origin::Client(username.to_string()),
            body: Body::Joined {
                username: username.to_string(),
            },
        }
    }

    pub fn left(username: &str) -> Self {
        Self {
            origin: Origin::Server,
            body: Body::Left {
                username: username.to_string(),
            },
        }
    }

    pub fn from_peer(line: impl Into<String>) -> Self {
        Self {
            origin: Origin::Peer,
            body: Body::Relayed(line.into()),
        }
    }

    /// Text delivered to local clients and, when forwarded, to the peer.
    pub fn render(&self) -> String {
        match &self.body {
            Body::Chat { username, text } => format!("{username}: {text}"),
            Body::Joined { username } => notice(&format!("{username} joined the chat")),
            Body::Left { username } => notice(&format!("{username} left the chat")),
            Body::Relayed(line) => line.clone(),
        }
    }
}

pub fn notice(text: &str) -> String {
    format!("*** {text} ***")
}

/// Strips line terminators and surrounding whitespace from a username.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_string()
}

/// Decodes one datagram payload as a single line.
///
/// A trailing newline, as netcat-style senders append, is dropped. Line
/// breaks inside the payload become spaces: everything downstream is
/// line-delimited, and one datagram must stay one message.
pub fn decode_datagram(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_end_matches(LINE_ENDINGS)
        .replace(LINE_ENDINGS, " ")
}

/// Reads one line without its terminator. `Ok(None)` means the stream ended.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One write per line keeps concurrent readers from seeing torn output.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
