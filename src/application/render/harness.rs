//! Minimal HTML page that renders one PDF page onto a canvas with pdf.js.
//!
//! The page exposes `window.__staveDone` and `window.__staveError`; a session
//! implementation turns those into the success and error signals.

use serde::Serialize;
use url::Url;

/// Everything a session needs to load one render.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessJob {
    pub source_url: Url,
    pub page: u32,
    pub scale: f64,
    pub html: String,
}

/// Where the harness loads pdf.js from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessAssets {
    pub pdfjs_url: String,
    pub worker_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobScript<'a> {
    source_url: &'a str,
    page: u32,
    scale: f64,
}

/// Scale factor that renders a page `width` pixels wide, given the page's
/// width in PDF points.
pub fn scale_for(width: u32, base_unit: u32) -> f64 {
    f64::from(width) / f64::from(base_unit.max(1))
}

pub fn build_job(
    source_url: Url,
    page: u32,
    width: u32,
    base_unit: u32,
    assets: &HarnessAssets,
) -> HarnessJob {
    let scale = scale_for(width, base_unit);
    let html = harness_html(&source_url, page, scale, assets);
    HarnessJob {
        source_url,
        page,
        scale,
        html,
    }
}

fn harness_html(source_url: &Url, page: u32, scale: f64, assets: &HarnessAssets) -> String {
    let job = script_literal(&JobScript {
        source_url: source_url.as_str(),
        page,
        scale,
    });
    let pdfjs = script_literal(&assets.pdfjs_url);
    let worker = script_literal(&assets.worker_url);

    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<style>html,body{{margin:0;padding:0;background:#fff}}canvas{{display:block}}</style>
</head>
<body>
<canvas id="page"></canvas>
<script type="module">
window.__staveDone = false;
window.__staveError = null;
const job = {job};
try {{
  const pdfjs = await import({pdfjs});
  pdfjs.GlobalWorkerOptions.workerSrc = {worker};
  const doc = await pdfjs.getDocument(job.sourceUrl).promise;
  const page = await doc.getPage(job.page);
  const viewport = page.getViewport({{ scale: job.scale }});
  const canvas = document.getElementById("page");
  canvas.width = Math.ceil(viewport.width);
  canvas.height = Math.ceil(viewport.height);
  await page.render({{ canvasContext: canvas.getContext("2d"), viewport }}).promise;
  window.__staveDone = true;
}} catch (err) {{
  window.__staveError = String((err && err.message) || err);
}}
</script>
</body>
</html>
"#
    )
}

/// JSON literal safe to embed inside a `<script>` element.
fn script_literal<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "null".to_string())
        .replace("</", "<\\/")
}
