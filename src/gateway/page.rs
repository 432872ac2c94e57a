//! HTML status page served at `/`

use std::fmt::Write;
use std::net::IpAddr;

use crate::relay::RelayForwarder;

/// Render the page for the current relay states
pub fn render(worker_host: IpAddr, relays: &[std::sync::Arc<RelayForwarder>]) -> String {
    let mut status = String::new();
    let mut feeds = String::new();

    for relay in relays {
        let id = relay.camera();
        let (class, state) = if relay.connected() {
            ("up", "connected")
        } else {
            ("down", "disconnected")
        };
        let _ = writeln!(
            status,
            r#"<li>Camera {id}: <span class="{class}">{state}</span> ({clients} viewers)</li>"#,
            clients = relay.consumer_count(),
        );
        let _ = writeln!(
            feeds,
            r#"<figure><figcaption>Camera {id}</figcaption><img src="/camera/{id}" alt="Camera {id}" onerror="this.replaceWith('Camera {id} not available')"></figure>"#,
        );
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>MJPEG relay</title>
<style>
body {{ font-family: sans-serif; background: #16181d; color: #e6e6e6; margin: 1.5em; }}
.up {{ color: #4cd07d; }}
.down {{ color: #ff6b6b; }}
.feeds {{ display: flex; flex-wrap: wrap; gap: 1em; }}
figure img {{ max-width: 640px; border-radius: 4px; }}
</style>
</head>
<body>
<h1>MJPEG relay</h1>
<p>Hub: <span class="up">running</span> &middot; Workers: {worker_host}</p>
<ul>
{status}</ul>
<p>
<button onclick="location.reload()">Refresh</button>
<button onclick="startWorkers()">Start workers</button>
</p>
<p>
<input id="prompt" type="text" size="40" placeholder="a person, a car">
<button onclick="setPrompt()">Set prompt</button>
</p>
<div class="feeds">
{feeds}</div>
<script>
function startWorkers() {{
  fetch('/start_jetson').then(r => r.text()).then(t => alert(t)).catch(e => alert('Error: ' + e));
}}
function setPrompt() {{
  const text = document.getElementById('prompt').value;
  if (!text) {{ return alert('Enter a prompt first'); }}
  fetch('/set_prompt?text=' + encodeURIComponent(text))
    .then(r => r.text()).then(t => alert(t)).catch(e => alert('Error: ' + e));
}}
</script>
</body>
</html>
"#
    )
}
