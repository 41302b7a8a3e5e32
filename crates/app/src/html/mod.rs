//! Embedded viewer page served at `/`.
//!
//! Kept as a `&'static str` so the binary has no asset directory to deploy.

pub const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Rearview</title>
<style>
  body { margin: 0; background: #111; color: #ddd; font: 14px sans-serif; }
  main { display: flex; flex-wrap: wrap; gap: 16px; padding: 16px; }
  img { max-width: 100%; background: #000; }
  textarea { width: 420px; height: 420px; background: #222; color: #ddd; font: 12px monospace; }
  #status { white-space: pre; font: 12px monospace; }
</style>
</head>
<body>
<main>
  <img src="/stream.mjpg" alt="live stream">
  <section>
    <textarea id="settings" spellcheck="false"></textarea><br>
    <button id="save">Apply</button> <span id="result"></span>
    <div id="status"></div>
  </section>
</main>
<script>
const settings = document.getElementById("settings");
const result = document.getElementById("result");

async function loadSettings() {
  const res = await fetch("/api/settings");
  settings.value = JSON.stringify(await res.json(), null, 2);
}

document.getElementById("save").onclick = async () => {
  let body;
  try { body = JSON.parse(settings.value); } catch (e) { result.textContent = e.message; return; }
  const res = await fetch("/api/settings", {
    method: "POST",
    headers: { "Content-Type": "application/json" },
    body: JSON.stringify(body),
  });
  const reply = await res.json();
  result.textContent = res.ok ? reply.outcome : reply.error;
  if (res.ok) loadSettings();
};

async function pollStatus() {
  try {
    const res = await fetch("/api/status");
    document.getElementById("status").textContent = JSON.stringify(await res.json(), null, 2);
  } catch (e) {}
  setTimeout(pollStatus, 2000);
}

loadSettings();
pollStatus();
</script>
</body>
</html>
"#;
