//! Server-rendered HTML. Live updates come from the WebSocket scripts below.

use std::fmt::Write;

use super::room::{MESSAGE_BACK_LOG, Room};
use super::state::RoomSummary;

pub const TITLE: &str = "Multi-User GPT Chat";
const PICO_CSS: &str = "https://cdn.jsdelivr.net/npm/@picocss/pico@1/css/pico.min.css";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    Error(String),
    Success(String),
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// `body_attrs` is inserted into the `<body>` tag as is.
fn layout(body_attrs: &str, body: &str, script: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{TITLE}</title>
<link rel="stylesheet" href="{PICO_CSS}">
<style>
.scroller {{ height: 50vh; overflow-y: auto; margin-bottom: 1em; }}
.meta {{ color: gray; font-size: 75%; margin-left: 0.5em; }}
.text {{ margin-left: 0.5em; }}
</style>
</head>
<body{body_attrs}>
<nav class="container-fluid"><ul><li><a href="/"><strong>{TITLE}</strong></a></li></ul></nav>
<main class="container">
{body}
</main>
{script}
</body>
</html>
"#
    )
}

fn alert(alert: Option<&Alert>) -> String {
    match alert {
        None => r#"<p id="alerts"></p>"#.to_string(),
        Some(Alert::Error(text)) => {
            format!(r#"<p id="alerts" style="color: red">{}</p>"#, escape(text))
        }
        Some(Alert::Success(text)) => {
            format!(r#"<p id="alerts" style="color: lime">{}</p>"#, escape(text))
        }
    }
}

/// Asks a new visitor for a user name.
pub fn user_name_page(default_name: &str, message: Option<&Alert>) -> String {
    let body = format!(
        r#"<h1>Set User Name</h1>
{}
<form method="post" action="/user">
<input type="text" name="name" placeholder="User Name" value="{}">
<button type="submit">Set</button>
</form>"#,
        alert(message),
        escape(default_name)
    );
    layout("", &body, "")
}

fn room_rows(rooms: &[RoomSummary]) -> String {
    let mut rows = String::new();
    for room in rooms {
        let _ = write!(
            rows,
            r#"<tr><td><a href="/{name}">{name}</a></td><td>{model}</td><td>{users}</td></tr>"#,
            name = escape(&room.name),
            model = escape(&room.model_name),
            users = room.users
        );
    }
    rows
}

const LOBBY_SCRIPT: &str = r#"<script>
(function () {
  const body = document.getElementById('rooms');
  const scheme = location.protocol === 'https:' ? 'wss://' : 'ws://';
  const socket = new WebSocket(scheme + location.host + '/lobby/ws');
  socket.onmessage = function (event) {
    const rooms = JSON.parse(event.data);
    body.replaceChildren();
    for (const room of rooms) {
      const row = document.createElement('tr');
      const link = document.createElement('a');
      link.href = '/' + encodeURIComponent(room.name);
      link.textContent = room.name;
      const cells = [link, document.createTextNode(room.model_name), document.createTextNode(String(room.users))];
      for (const content of cells) {
        const cell = document.createElement('td');
        cell.appendChild(content);
        row.appendChild(cell);
      }
      body.appendChild(row);
    }
  };
})();
</script>"#;

/// Room list and the form to create a room.
pub fn lobby_page(models: &[String], rooms: &[RoomSummary], message: Option<&Alert>) -> String {
    let mut options = String::new();
    for (i, model) in models.iter().enumerate() {
        let selected = if i == 0 { " selected" } else { "" };
        let _ = write!(
            options,
            r#"<option value="{m}"{selected}>{m}</option>"#,
            m = escape(model)
        );
    }

    let body = format!(
        r#"<h1>Chat Rooms</h1>
{}
<form method="post" action="/rooms">
<select name="model">{options}</select>
<input type="text" name="room" placeholder="Room Name" value="test">
<button type="submit">Create Room</button>
</form>
<br><br>
<table>
<thead><tr><th>Room Name</th><th>GPT model</th><th>User Chatting</th></tr></thead>
<tbody id="rooms">{}</tbody>
</table>"#,
        alert(message),
        room_rows(rooms)
    );
    layout("", &body, LOBBY_SCRIPT)
}

pub fn room_not_found_page(room_name: &str) -> String {
    let body = format!(
        "<h1>Room not found</h1>\n<p>No room named \"{}\" found</p>",
        escape(room_name)
    );
    layout("", &body, "")
}

const ROOM_SCRIPT: &str = r#"<script>
(function () {
  const ELLIPSIS = '⋯';
  const NO_ANSWER = '<No answer from GPT>';
  const room = document.body.dataset.room;
  const list = document.getElementById('messages');
  const input = document.getElementById('message');
  const scheme = location.protocol === 'https:' ? 'wss://' : 'ws://';
  const socket = new WebSocket(scheme + location.host + '/' + encodeURIComponent(room) + '/ws');

  function stripEllipsis(text) {
    while (text.endsWith(ELLIPSIS)) {
      text = text.slice(0, -ELLIPSIS.length);
    }
    return text;
  }

  function findText(id) {
    const line = list.querySelector('[data-message-id="' + CSS.escape(id) + '"]');
    return line ? line.querySelector('.text') : null;
  }

  function addLine(id, userName, date, text) {
    if (findText(id)) {
      return null;
    }
    const line = document.createElement('div');
    line.dataset.messageId = id;
    const header = document.createElement('div');
    const strong = document.createElement('strong');
    strong.textContent = userName;
    const meta = document.createElement('span');
    meta.className = 'meta';
    meta.textContent = date.toLocaleString();
    header.append(strong, meta);
    const span = document.createElement('span');
    span.className = 'text';
    span.textContent = text;
    line.append(header, span);
    list.appendChild(line);
    list.scrollTop = list.scrollHeight;
    return span;
  }

  socket.onmessage = function (event) {
    const message = JSON.parse(event.data);
    if (message.type === 'line') {
      const plain = message.kind === 'message';
      const span = addLine(message.id, message.user_name, new Date(message.timestamp * 1000),
        plain ? message.text : '*' + message.text + '*');
      if (span && message.kind === 'join') span.style.color = 'lime';
      if (span && message.kind === 'leave') span.style.color = 'red';
    } else if (message.type === 'wait') {
      addLine(message.id, message.user_name, new Date(message.dt), ELLIPSIS);
    } else if (message.type === 'append') {
      const span = findText(message.id);
      if (span) span.textContent = stripEllipsis(span.textContent) + message.message + ELLIPSIS;
      list.scrollTop = list.scrollHeight;
    } else if (message.type === 'complete') {
      const span = findText(message.id);
      if (span) {
        const text = stripEllipsis(span.textContent);
        span.textContent = text ? text : NO_ANSWER;
      }
    } else {
      console.error('Unknown message type: ' + message.type);
    }
  };

  document.getElementById('send').addEventListener('click', function () {
    const text = input.value.trim();
    input.value = '';
    if (text) socket.send(text);
  });
})();
</script>"#;

/// The chat view of one room.
pub fn room_page(room: &Room) -> String {
    let mut config = String::new();
    let _ = write!(
        config,
        "<tr><td>Thread count</td><td>{}</td></tr>",
        room.thread_count
    );
    for (key, value) in &room.config_rows {
        let _ = write!(
            config,
            "<tr><td>{}</td><td>{}</td></tr>",
            escape(key),
            escape(value)
        );
    }

    let body = format!(
        r#"<h1>Chat Room: "{name}"</h1>
<p>{summary}</p>
<div id="messages" class="scroller" data-lines="{MESSAGE_BACK_LOG}"></div>
<textarea id="message"></textarea>
<button id="send" class="inline">Send</button>
<h2>model config:</h2>
<table>
<thead><tr><th>Parameter</th><th>Value</th></tr></thead>
<tbody>{config}</tbody>
</table>"#,
        name = escape(&room.name),
        summary = escape(&room.summary),
    );

    // the script reads the room name from <body data-room>
    let attrs = format!(r#" data-room="{}""#, escape(&room.name));
    layout(&attrs, &body, ROOM_SCRIPT)
}
