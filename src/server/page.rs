// src/server/page.rs
use serde_json::Value;

use super::locale::Locale;

/// Produces the key-entry page served on `GET /session/{token}`.
pub trait PageRenderer: Send + Sync {
    fn render(&self, locale: Locale, submit_url: &str) -> String;
}

struct PageCopy {
    title: &'static str,
    placeholder: &'static str,
    button: &'static str,
    empty_alert: &'static str,
    sent: &'static str,
    error_prefix: &'static str,
}

const EN: PageCopy = PageCopy {
    title: "Paste your access key",
    placeholder: "Access key",
    button: "Send",
    empty_alert: "Enter a key",
    sent: "Key sent. You can go back to the TV.",
    error_prefix: "Error: ",
};

const RU: PageCopy = PageCopy {
    title: "Вставьте ключ",
    placeholder: "Ключ",
    button: "Отправить",
    empty_alert: "Введите ключ",
    sent: "Ключ отправлен. Можно вернуться к ТВ.",
    error_prefix: "Ошибка: ",
};

fn copy_for(locale: Locale) -> &'static PageCopy {
    match locale {
        Locale::En => &EN,
        Locale::Ru => &RU,
    }
}

/// The page bundled with the receiver.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinPages;

impl PageRenderer for BuiltinPages {
    fn render(&self, locale: Locale, submit_url: &str) -> String {
        let c = copy_for(locale);
        format!(
            r#"<!doctype html>
<html lang="{lang}">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<title>{title}</title>
</head>
<body>
<h3>{title}</h3>
<input id="key" style="width:100%;padding:8px" placeholder="{placeholder}" autocomplete="off">
<button onclick="send()">{button}</button>
<p id="msg"></p>
<script>
async function send() {{
  const key = document.getElementById('key').value.trim();
  if (!key) {{ alert({js_empty}); return; }}
  const msg = document.getElementById('msg');
  try {{
    const r = await fetch({js_url}, {{
      method: 'POST',
      headers: {{ 'Content-Type': 'application/json' }},
      body: JSON.stringify({{ key }})
    }});
    const j = await r.json().catch(() => ({{ ok: false, error: String(r.status) }}));
    msg.innerText = j.ok ? {js_sent} : {js_error} + (j.error || 'unknown');
  }} catch (e) {{
    msg.innerText = {js_error} + e;
  }}
}}
</script>
</body>
</html>
"#,
            lang = locale.tag(),
            title = escape_html(c.title),
            placeholder = escape_html(c.placeholder),
            button = escape_html(c.button),
            js_empty = js_string(c.empty_alert),
            js_url = js_string(submit_url),
            js_sent = js_string(c.sent),
            js_error = js_string(c.error_prefix),
        )
    }
}

fn js_string(s: &str) -> String {
    Value::String(s.to_owned()).to_string()
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
