//! Line-oriented MobWrite wire protocol.
//!
//! Request block (one per connection, terminated by a blank line):
//! ```text
//! u:alice            username (U: echo usernames in the reply)
//! h:alice-tab-1      collaborator handle (H: list collaborators in the reply)
//! f:4:notes          server version the client last saw, file name
//! d:7:=3\t+x\t=2     delta against the shadow (D: force)
//! r:7:Hello%20       raw dump (R: force overwrite)
//! n:notes            nullify the document
//! b:blk 3 1 u%3Aal   fragment 1 of a 3-slot buffer named "blk"
//!                    (blank line)
//! ```
//!
//! Reply block:
//! ```text
//! u:alice            only when echo was requested and the user changed
//! F:7:notes          shadow client version, on every user/file boundary
//! d:4:=3\t-1\t=2     pending edit-stack lines, oldest first
//! R:5:Hello          raw overwrite after a protocol failure
//! C:alice,bob        collaborator handles when requested
//! ```

use log::{debug, info, warn};

use crate::escape;

/// What an action asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Differential edit against the shadow.
    Delta,
    /// Full text dump.
    Raw,
    /// Delete the document.
    Null,
}

/// One parsed edit for a (username, filename) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub username: String,
    pub filename: String,
    pub mode: Mode,
    pub server_version: u64,
    pub client_version: u64,
    /// Delta text or URL-escaped raw text, as received.
    pub data: String,
    pub force: bool,
    pub handle: Option<String>,
}

impl Action {
    /// True when both actions address the same view.
    pub fn same_view(&self, other: &Action) -> bool {
        self.username == other.username && self.filename == other.filename
    }
}

/// A parsed request block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub actions: Vec<Action>,
    /// Sticky for the whole block once a `U` line is seen.
    pub echo_username: bool,
    /// Set by an `H` line.
    pub echo_collaborators: bool,
}

/// Destination for `b:` fragments.
///
/// Returns the reassembled, unescaped block once every slot of the buffer
/// has been written.
pub trait FragmentSink {
    fn feed_fragment(&self, name: &str, size: usize, index: usize, text: &str) -> Option<String>;
}

/// True when the block ends with a blank line.
pub fn is_terminated(data: impl AsRef<[u8]>) -> bool {
    let data = data.as_ref();
    [&b"\n\n"[..], b"\r\r", b"\n\r\n\r", b"\r\n\r\n"]
        .iter()
        .any(|end| data.ends_with(end))
}

/// Parse a request block into actions.
///
/// A block that is not terminated by a blank line yields no actions.
pub fn parse_request(data: &str, buffers: &impl FragmentSink) -> Request {
    let mut request = Request::default();
    parse_into(data, buffers, &mut request);
    request
}

/// Parser state carried from line to line.
#[derive(Default)]
struct Cursor {
    username: Option<String>,
    filename: Option<String>,
    handle: Option<String>,
    server_version: Option<u64>,
}

fn parse_into(data: &str, buffers: &impl FragmentSink, request: &mut Request) {
    if !is_terminated(data) {
        warn!("Truncated data: {:?}", data);
        return;
    }

    let mut cursor = Cursor::default();
    for line in lines(data) {
        if line.is_empty() {
            // Terminate on blank line.
            break;
        }
        let mut chars = line.chars();
        let (Some(code), Some(':')) = (chars.next(), chars.next()) else {
            continue;
        };
        if code == ':' {
            continue;
        }
        let mut value = chars.as_str();

        // Versioned lines carry `<n>:` before their value.
        let mut version = 0;
        if "FfDdRr".contains(code) {
            let Some((number, rest)) = value.split_once(':').filter(|(n, _)| !n.is_empty()) else {
                warn!("Missing version number: {}", line);
                continue;
            };
            let Ok(number) = number.parse::<u64>() else {
                warn!("Invalid version number: {}", line);
                continue;
            };
            version = number;
            value = rest;
        }

        match code {
            'b' | 'B' => {
                let Some((name, size, index, text)) = parse_fragment(value) else {
                    warn!("Invalid buffer format: {}", value);
                    continue;
                };
                let Some(block) = buffers.feed_fragment(name, size, index, text) else {
                    continue;
                };
                let Some(last) = block.chars().last() else {
                    continue;
                };
                info!("Executing buffer: {}_{}", name, size);
                // Duplicate the trailing line break to close the block.
                let mut block = block;
                block.push(last);
                parse_into(&block, buffers, request);
            }
            'u' | 'U' => {
                cursor.username = Some(value.to_string());
                if code == 'U' {
                    request.echo_username = true;
                }
            }
            'h' | 'H' => {
                cursor.handle = Some(value.to_string());
                if code == 'H' {
                    request.echo_collaborators = true;
                }
            }
            'f' | 'F' => {
                cursor.filename = Some(value.to_string());
                cursor.server_version = Some(version);
            }
            'n' | 'N' => {
                cursor.filename = Some(value.to_string());
                push_action(&cursor, request, Mode::Null, 0, "", code == 'N');
            }
            'd' | 'D' => push_action(&cursor, request, Mode::Delta, version, value, code == 'D'),
            'r' | 'R' => push_action(&cursor, request, Mode::Raw, version, value, code == 'R'),
            _ => warn!("Unknown command: {}", line),
        }
    }
}

fn push_action(
    cursor: &Cursor,
    request: &mut Request,
    mode: Mode,
    client_version: u64,
    data: &str,
    force: bool,
) {
    let (Some(username), Some(filename)) = (&cursor.username, &cursor.filename) else {
        warn!(
            "Skipping {:?} action: username={:?}, filename={:?}",
            mode, cursor.username, cursor.filename
        );
        return;
    };
    request.actions.push(Action {
        username: username.clone(),
        filename: filename.clone(),
        mode,
        server_version: cursor.server_version.unwrap_or(0),
        client_version,
        data: data.to_string(),
        force,
        handle: cursor.handle.clone(),
    });
}

/// `<name> <size> <index> <text>`; the text may contain spaces.
fn parse_fragment(value: &str) -> Option<(&str, usize, usize, &str)> {
    let mut parts = value.splitn(4, ' ');
    let name = parts.next()?;
    let size = parts.next()?.parse().ok()?;
    let index = parts.next()?.parse().ok()?;
    let text = parts.next()?;
    Some((name, size, index, text))
}

/// Split on `\r\n`, `\r` or `\n`.
fn lines(data: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(data);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.find(['\r', '\n']) {
            Some(pos) => {
                let skip = if current[pos..].starts_with("\r\n") { 2 } else { 1 };
                rest = Some(&current[pos + skip..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                (!current.is_empty()).then_some(current)
            }
        }
    })
}

// ─── Reply encoding ──────────────────────────────────────────────────

/// Edit-stack line carrying a delta.
pub fn delta_line(force: bool, server_version: u64, delta: &str) -> String {
    let code = if force { 'D' } else { 'd' };
    format!("{code}:{server_version}:{delta}")
}

/// Edit-stack line carrying a full text overwrite; `r:` when there is no
/// text at all.
pub fn raw_line(server_version: u64, text: Option<&str>) -> String {
    match text {
        Some(text) => format!("R:{server_version}:{}", escape::escape(text)),
        None => format!("r:{server_version}:"),
    }
}

/// Accumulates the reply block for one request.
#[derive(Debug, Default)]
pub struct ReplyWriter {
    out: String,
    echo_username: bool,
    last_username: Option<String>,
    last_filename: Option<String>,
}

impl ReplyWriter {
    pub fn new(echo_username: bool) -> Self {
        Self {
            echo_username,
            ..Self::default()
        }
    }

    /// Write the output of one (username, filename) run.
    pub fn write_run(&mut self, username: &str, filename: &str, client_version: u64, edits: &[String]) {
        let user_changed = self.last_username.as_deref() != Some(username);
        if self.echo_username && user_changed {
            self.out.push_str(&format!("u:{username}\n"));
        }
        if user_changed || self.last_filename.as_deref() != Some(filename) {
            self.out.push_str(&format!("F:{client_version}:{filename}\n"));
        }
        for edit in edits {
            self.out.push_str(edit);
            self.out.push('\n');
        }
        self.last_username = Some(username.to_string());
        self.last_filename = Some(filename.to_string());
    }

    /// Append the collaborator list line.
    pub fn write_collaborators(&mut self, handles: &[String]) {
        let mut handles: Vec<&str> = handles.iter().map(String::as_str).collect();
        handles.sort_unstable();
        handles.dedup();
        self.out.push_str(&format!("C:{}\n", handles.join(",")));
    }

    pub fn finish(self) -> String {
        debug!("Reply is {} bytes", self.out.len());
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferStore;

    fn parse(data: &str) -> Request {
        parse_request(data, &BufferStore::default())
    }

    #[test]
    fn test_requires_blank_line() {
        assert!(parse("u:alice\nf:0:doc\nr:0:Hello\n").actions.is_empty());
        assert_eq!(parse("u:alice\nf:0:doc\nr:0:Hello\n\n").actions.len(), 1);
        assert_eq!(parse("u:alice\r\nf:0:doc\r\nr:0:Hello\r\n\r\n").actions.len(), 1);
        assert_eq!(parse("u:alice\rf:0:doc\rr:0:Hello\r\r").actions.len(), 1);
    }

    #[test]
    fn test_parses_raw_and_delta() {
        let request = parse("u:alice\nf:3:doc\nr:2:Hello%20World\nD:2:=5\t+x\n\n");
        assert_eq!(request.actions.len(), 2);
        let raw = &request.actions[0];
        assert_eq!(raw.mode, Mode::Raw);
        assert_eq!(raw.username, "alice");
        assert_eq!(raw.filename, "doc");
        assert_eq!(raw.server_version, 3);
        assert_eq!(raw.client_version, 2);
        assert_eq!(raw.data, "Hello%20World");
        assert!(!raw.force);
        let delta = &request.actions[1];
        assert_eq!(delta.mode, Mode::Delta);
        assert_eq!(delta.data, "=5\t+x");
        assert!(delta.force);
    }

    #[test]
    fn test_skips_lines_without_context() {
        // No username yet.
        let request = parse("f:0:doc\nd:0:=1\nu:bob\nd:0:=1\n\n");
        assert_eq!(request.actions.len(), 1);
        assert_eq!(request.actions[0].username, "bob");
    }

    #[test]
    fn test_skips_malformed_lines() {
        let request = parse("u:alice\nf:0:doc\nxyz\n:a\nd:=1\nd:-1:=1\nd:a:=1\nq:what\nd:0:=1\n\n");
        assert_eq!(request.actions.len(), 1);
        assert_eq!(request.actions[0].client_version, 0);
    }

    #[test]
    fn test_missing_file_version_skips_file_line() {
        let request = parse("u:alice\nf:doc\nd:0:=1\n\n");
        assert!(request.actions.is_empty());
    }

    #[test]
    fn test_stops_at_first_blank_line() {
        let request = parse("u:alice\nf:0:doc\n\nd:0:=1\n\n");
        assert!(request.actions.is_empty());
    }

    #[test]
    fn test_echo_flags_and_handle() {
        let request = parse("U:alice\nH:alice-1\nf:0:doc\nr:0:x\nu:bob\nh:bob-1\nr:0:y\n\n");
        assert!(request.echo_username);
        assert!(request.echo_collaborators);
        assert_eq!(request.actions[0].handle.as_deref(), Some("alice-1"));
        assert_eq!(request.actions[1].username, "bob");
        assert_eq!(request.actions[1].handle.as_deref(), Some("bob-1"));
    }

    #[test]
    fn test_nullify_sets_filename() {
        let request = parse("u:alice\nf:5:doc\nn:other\n\n");
        assert_eq!(request.actions.len(), 1);
        assert_eq!(request.actions[0].mode, Mode::Null);
        assert_eq!(request.actions[0].filename, "other");
    }

    #[test]
    fn test_buffer_reassembly_feeds_parser() {
        let store = BufferStore::default();
        let block = escape::escape("u:alice\nf:0:doc\nr:0:Hi\n");
        let (first, second) = block.split_at(10);
        let data = format!("b:blk 2 2 {second}\nb:blk 2 1 {first}\n\n");
        let request = parse_request(&data, &store);
        assert_eq!(request.actions.len(), 1);
        assert_eq!(request.actions[0].data, "Hi");
        assert!(store.is_empty());
    }

    #[test]
    fn test_single_slot_buffer() {
        let block = escape::escape("U:carol\nf:1:doc\nd:0:=2\n");
        let request = parse(&format!("b:x 1 1 {block}\n\n"));
        assert!(request.echo_username);
        assert_eq!(request.actions.len(), 1);
        assert_eq!(request.actions[0].username, "carol");
    }

    #[test]
    fn test_reply_writer_boundaries() {
        let mut reply = ReplyWriter::new(true);
        reply.write_run("alice", "a", 1, &["d:0:=3".to_string()]);
        reply.write_run("alice", "b", 2, &["d:0:".to_string()]);
        reply.write_run("bob", "b", 0, &[raw_line(4, Some("x y%")), raw_line(5, None)]);
        assert_eq!(
            reply.finish(),
            "u:alice\nF:1:a\nd:0:=3\nF:2:b\nd:0:\nu:bob\nF:0:b\nR:4:x y%25\nr:5:\n"
        );
    }

    #[test]
    fn test_reply_writer_without_echo() {
        let mut reply = ReplyWriter::new(false);
        reply.write_run("alice", "a", 0, &[delta_line(true, 3, "=1")]);
        reply.write_collaborators(&["bob".to_string(), "alice".to_string(), "bob".to_string()]);
        assert_eq!(reply.finish(), "F:0:a\nD:3:=1\nC:alice,bob\n");
    }
}
