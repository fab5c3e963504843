//! Event-socket wire format: frames, events, commands.
//!
//! The switch speaks a line-oriented protocol: a block of `Key: Value`
//! headers terminated by a blank line, optionally followed by
//! `Content-Length` bytes of body. Subscribed events arrive as
//! `text/event-plain` frames whose body is itself a header block with
//! URL-encoded values.

use std::collections::HashMap;
use std::fmt;

use super::error::EslError;

/// Content types the bridge cares about.
pub const CONTENT_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_API_RESPONSE: &str = "api/response";
pub const CONTENT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_DISCONNECT: &str = "text/disconnect-notice";

/// One decoded frame off the socket.
#[derive(Debug, Clone)]
pub struct EslFrame {
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl EslFrame {
    pub fn content_type(&self) -> &str {
        self.headers
            .get("Content-Type")
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn reply_text(&self) -> &str {
        self.headers
            .get("Reply-Text")
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Incremental frame decoder over a growing byte buffer.
///
/// Returns the decoded frame and the number of bytes consumed, or `None`
/// when the buffer does not yet hold a complete frame.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(EslFrame, usize)>, EslError> {
    let Some(header_end) = find_blank_line(buf) else {
        return Ok(None);
    };

    let header_bytes = &buf[..header_end];
    let header_text = std::str::from_utf8(header_bytes)
        .map_err(|_| EslError::Protocol("non-utf8 frame headers".to_string()))?;

    let mut headers = HashMap::new();
    for line in header_text.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(EslError::Protocol(format!("malformed header line: {line}")));
        };
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }

    let body_start = header_end + 2; // skip the blank line
    let content_length = headers
        .get("Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if buf.len() < body_start + content_length {
        return Ok(None);
    }

    let body = if content_length > 0 {
        let raw = &buf[body_start..body_start + content_length];
        Some(
            std::str::from_utf8(raw)
                .map_err(|_| EslError::Protocol("non-utf8 frame body".to_string()))?
                .to_string(),
        )
    } else {
        None
    };

    Ok(Some((EslFrame { headers, body }, body_start + content_length)))
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// A call event decoded from a `text/event-plain` body.
#[derive(Debug, Clone)]
pub struct EslEvent {
    pub name: String,
    pub headers: HashMap<String, String>,
}

impl EslEvent {
    pub fn from_plain_body(body: &str) -> Result<Self, EslError> {
        let mut headers = HashMap::new();
        for line in body.lines() {
            if line.is_empty() {
                break; // event body (if any) follows; the bridge does not consume it
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_string(), url_decode(value.trim()));
            }
        }
        let name = headers
            .get("Event-Name")
            .cloned()
            .ok_or_else(|| EslError::Protocol("event without Event-Name".to_string()))?;
        Ok(Self { name, headers })
    }

    /// UUID of the call leg this event belongs to.
    pub fn leg_id(&self) -> Option<&str> {
        self.headers.get("Unique-ID").map(String::as_str)
    }

    pub fn caller_number(&self) -> Option<&str> {
        self.headers
            .get("Caller-Caller-ID-Number")
            .map(String::as_str)
    }

    /// Destination number the caller dialed, used for entry-point matching.
    pub fn destination(&self) -> Option<&str> {
        self.headers
            .get("Caller-Destination-Number")
            .map(String::as_str)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn hangup_cause(&self) -> Option<&str> {
        self.headers.get("Hangup-Cause").map(String::as_str)
    }
}

fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &value[i + 1..i + 3];
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Commands the bridge issues toward the switch.
#[derive(Debug, Clone)]
pub enum EslCommand {
    Auth { password: String },
    Subscribe { events: Vec<&'static str> },
    /// Fire-and-collect api command (`api originate ...`, `api status`).
    Api { command: String },
    /// Execute a dialplan application on a specific leg.
    Execute { leg_id: String, app: String, arg: Option<String> },
}

impl EslCommand {
    pub fn answer(leg_id: &str) -> Self {
        Self::Execute {
            leg_id: leg_id.to_string(),
            app: "answer".to_string(),
            arg: None,
        }
    }

    pub fn play(leg_id: &str, audio_ref: &str) -> Self {
        Self::Execute {
            leg_id: leg_id.to_string(),
            app: "playback".to_string(),
            arg: Some(audio_ref.to_string()),
        }
    }

    pub fn stop_play(leg_id: &str) -> Self {
        Self::Api {
            command: format!("uuid_break {leg_id} all"),
        }
    }

    pub fn hangup(leg_id: &str) -> Self {
        Self::Api {
            command: format!("uuid_kill {leg_id} NORMAL_CLEARING"),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Api {
            command: "status".to_string(),
        }
    }

    pub fn originate(dial_string: &str, destination_app: &str) -> Self {
        Self::Api {
            command: format!("originate {dial_string} {destination_app}"),
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            Self::Auth { password } => format!("auth {password}\n\n"),
            Self::Subscribe { events } => {
                format!("event plain {}\n\n", events.join(" "))
            }
            Self::Api { command } => format!("api {command}\n\n"),
            Self::Execute { leg_id, app, arg } => {
                let mut msg = format!(
                    "sendmsg {leg_id}\ncall-command: execute\nexecute-app-name: {app}\n"
                );
                if let Some(arg) = arg {
                    msg.push_str(&format!("execute-app-arg: {arg}\n"));
                }
                msg.push_str("event-lock: true\n\n");
                msg
            }
        }
    }
}

impl fmt::Display for EslCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth { .. } => write!(f, "auth"),
            Self::Subscribe { .. } => write!(f, "subscribe"),
            Self::Api { command } => write!(f, "api {command}"),
            Self::Execute { app, leg_id, .. } => write!(f, "execute {app} on {leg_id}"),
        }
    }
}

/// Outcome of a command as reported by the switch.
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub ok: bool,
    pub text: String,
}

impl CommandReply {
    pub fn from_frame(frame: &EslFrame) -> Self {
        match frame.content_type() {
            CONTENT_API_RESPONSE => {
                let body = frame.body.as_deref().unwrap_or("").trim().to_string();
                Self {
                    ok: !body.starts_with("-ERR"),
                    text: body,
                }
            }
            _ => {
                let text = frame.reply_text().to_string();
                Self {
                    ok: text.starts_with("+OK"),
                    text,
                }
            }
        }
    }

    /// Leg UUID from an `+OK <uuid>` originate response.
    pub fn leg_id(&self) -> Option<&str> {
        self.text.strip_prefix("+OK ").map(str::trim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_frame_without_body() {
        let raw = b"Content-Type: auth/request\n\n";
        let (frame, used) = decode_frame(raw).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(frame.content_type(), CONTENT_AUTH_REQUEST);
        assert!(frame.body.is_none());
    }

    #[test]
    fn test_decode_frame_with_body() {
        let body = "Event-Name: CHANNEL_ANSWER\nUnique-ID: abc-123\n";
        let raw = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let (frame, used) = decode_frame(raw.as_bytes()).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(frame.body.as_deref(), Some(body));
    }

    #[test]
    fn test_decode_partial_frame_returns_none() {
        let raw = b"Content-Type: command/reply\nReply-Text: +OK";
        assert!(decode_frame(raw).unwrap().is_none());

        let raw = b"Content-Type: text/event-plain\nContent-Length: 100\n\nshort";
        assert!(decode_frame(raw).unwrap().is_none());
    }

    #[test]
    fn test_decode_two_frames_consumes_first_only() {
        let raw = b"Content-Type: auth/request\n\nContent-Type: command/reply\nReply-Text: +OK\n\n";
        let (frame, used) = decode_frame(raw).unwrap().unwrap();
        assert_eq!(frame.content_type(), CONTENT_AUTH_REQUEST);
        let (frame2, _) = decode_frame(&raw[used..]).unwrap().unwrap();
        assert_eq!(frame2.content_type(), CONTENT_COMMAND_REPLY);
        assert_eq!(frame2.reply_text(), "+OK");
    }

    #[test]
    fn test_event_from_plain_body() {
        let body = "Event-Name: CHANNEL_HANGUP\nUnique-ID: leg-9\nHangup-Cause: NORMAL_CLEARING\nCaller-Caller-ID-Number: 1000\n";
        let event = EslEvent::from_plain_body(body).unwrap();
        assert_eq!(event.name, "CHANNEL_HANGUP");
        assert_eq!(event.leg_id(), Some("leg-9"));
        assert_eq!(event.hangup_cause(), Some("NORMAL_CLEARING"));
        assert_eq!(event.caller_number(), Some("1000"));
    }

    #[test]
    fn test_event_url_decoding() {
        let body = "Event-Name: CHANNEL_CREATE\nUnique-ID: leg-1\nCaller-Destination-Number: %E4%BD%A0%E5%A5%BD\n";
        let event = EslEvent::from_plain_body(body).unwrap();
        assert_eq!(event.destination(), Some("你好"));
    }

    #[test]
    fn test_event_without_name_is_protocol_error() {
        assert!(EslEvent::from_plain_body("Unique-ID: x\n").is_err());
    }

    #[test]
    fn test_execute_command_wire_format() {
        let wire = EslCommand::play("leg-1", "/tmp/hello.wav").to_wire();
        assert!(wire.starts_with("sendmsg leg-1\n"));
        assert!(wire.contains("execute-app-name: playback\n"));
        assert!(wire.contains("execute-app-arg: /tmp/hello.wav\n"));
        assert!(wire.ends_with("\n\n"));
    }

    #[test]
    fn test_api_reply_parsing() {
        let frame = EslFrame {
            headers: HashMap::from([(
                "Content-Type".to_string(),
                CONTENT_API_RESPONSE.to_string(),
            )]),
            body: Some("+OK 7f6f9e1c-aaaa-bbbb-cccc-000000000001\n".to_string()),
        };
        let reply = CommandReply::from_frame(&frame);
        assert!(reply.ok);
        assert_eq!(
            reply.leg_id(),
            Some("7f6f9e1c-aaaa-bbbb-cccc-000000000001")
        );
    }

    #[test]
    fn test_error_reply_parsing() {
        let frame = EslFrame {
            headers: HashMap::from([(
                "Content-Type".to_string(),
                CONTENT_API_RESPONSE.to_string(),
            )]),
            body: Some("-ERR NO_ANSWER\n".to_string()),
        };
        let reply = CommandReply::from_frame(&frame);
        assert!(!reply.ok);
        assert_eq!(reply.text, "-ERR NO_ANSWER");
    }
}
