use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;

use crate::models::job::{NarrationMode, PageLayout};
use crate::services::capabilities::{ExtractError, Extraction, Extractor};

const VISION_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Fallback extractor: Google Cloud Vision document text detection.
///
/// Returns the page text block by block (roughly one block per speech
/// bubble or caption), without narrative framing.
pub struct CloudVisionOcr {
    http: Client,
    url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResult {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<Status>,
}

#[derive(Deserialize)]
struct Status {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Block {
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
    confidence: Option<f64>,
    bounding_box: Option<BoundingPoly>,
}

#[derive(Deserialize)]
struct Paragraph {
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Word {
    #[serde(default)]
    symbols: Vec<Symbol>,
    bounding_box: Option<BoundingPoly>,
}

/// Vision omits a coordinate when it is zero.
#[derive(Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

#[derive(Deserialize)]
struct Vertex {
    #[serde(default)]
    x: i64,
    #[serde(default)]
    y: i64,
}

#[derive(Debug, Clone, Copy)]
struct Rect {
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

impl Rect {
    fn of(poly: &BoundingPoly) -> Option<Self> {
        let xs = poly.vertices.iter().map(|v| v.x);
        let ys = poly.vertices.iter().map(|v| v.y);
        Some(Self {
            left: xs.clone().min()?,
            right: xs.max()?,
            top: ys.clone().min()?,
            bottom: ys.max()?,
        })
    }

    fn height(&self) -> i64 {
        self.bottom - self.top
    }

    /// Both the horizontal and the vertical gap are at most `margin`.
    fn near(&self, other: &Rect, margin: i64) -> bool {
        let gap_x = (self.left.max(other.left) - self.right.min(other.right)).max(0);
        let gap_y = (self.top.max(other.top) - self.bottom.min(other.bottom)).max(0);
        gap_x <= margin && gap_y <= margin
    }
}

/// Bubbles further apart than this many average bubble heights are taken to
/// sit in different panels.
const PANEL_GAP_HEIGHTS: i64 = 2;

#[derive(Deserialize)]
struct Symbol {
    #[serde(default)]
    text: String,
}

impl CloudVisionOcr {
    pub fn new(api_key: &str) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().build()?,
            url: VISION_URL.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl Extractor for CloudVisionOcr {
    fn mode(&self) -> NarrationMode {
        NarrationMode::Ocr
    }

    async fn extract(&self, image: &[u8]) -> Result<Extraction, ExtractError> {
        let body = serde_json::json!({
            "requests": [{
                "image": { "content": base64::engine::general_purpose::STANDARD.encode(image) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
            }]
        });

        let response = self
            .http
            .post(&self.url)
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: AnnotateResponse = response.json().await?;
        annotation_to_extraction(parsed)
    }
}

fn annotation_to_extraction(parsed: AnnotateResponse) -> Result<Extraction, ExtractError> {
    let result = parsed
        .responses
        .into_iter()
        .next()
        .ok_or_else(|| ExtractError::Parse("empty responses array".to_string()))?;

    if let Some(error) = result.error {
        return Err(ExtractError::Api {
            status: error.code,
            message: error.message,
        });
    }

    let Some(annotation) = result.full_text_annotation else {
        // No text detected at all; the pipeline decides what an empty page means.
        return Ok(Extraction {
            text: String::new(),
            mode: NarrationMode::Ocr,
            confidence: 0.0,
            tokens_used: None,
            layout: Some(PageLayout::default()),
        });
    };

    let blocks: Vec<&Block> = annotation.pages.iter().flat_map(|p| &p.blocks).collect();
    let block_texts: Vec<String> = blocks
        .iter()
        .map(|block| block_text(block))
        .filter(|text| !text.is_empty())
        .collect();
    let layout = page_layout(&blocks);

    let text = if block_texts.is_empty() {
        annotation.text.trim().to_string()
    } else {
        block_texts.join("\n")
    };

    let confidences: Vec<f64> = blocks.iter().filter_map(|b| b.confidence).collect();
    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };

    Ok(Extraction {
        text,
        mode: NarrationMode::Ocr,
        confidence,
        tokens_used: None,
        layout: Some(layout),
    })
}

/// Count words, bubbles and panels from the block geometry.
///
/// Each non-empty block is a bubble. Panels are the connected groups of
/// bubbles lying within [`PANEL_GAP_HEIGHTS`] average bubble heights of each
/// other. Without any geometry the page is one panel.
fn page_layout(blocks: &[&Block]) -> PageLayout {
    let bubbles: Vec<&Block> = blocks
        .iter()
        .copied()
        .filter(|block| !block_text(block).is_empty())
        .collect();

    let text_blocks = bubbles
        .iter()
        .flat_map(|block| &block.paragraphs)
        .flat_map(|paragraph| &paragraph.words)
        .filter(|word| word.symbols.iter().any(|s| !s.text.trim().is_empty()))
        .count();

    let rects: Vec<Rect> = bubbles
        .iter()
        .filter_map(|block| block.bounding_box.as_ref().and_then(Rect::of))
        .collect();

    let panel_count = if rects.is_empty() {
        usize::from(!bubbles.is_empty())
    } else {
        let average_height = rects.iter().map(Rect::height).sum::<i64>() / rects.len() as i64;
        count_groups(&rects, average_height.max(1) * PANEL_GAP_HEIGHTS)
    };

    PageLayout {
        text_blocks: u32::try_from(text_blocks).unwrap_or(u32::MAX),
        bubble_count: u32::try_from(bubbles.len()).unwrap_or(u32::MAX),
        panel_count: u32::try_from(panel_count).unwrap_or(u32::MAX),
    }
}

/// Number of connected components under [`Rect::near`].
fn count_groups(rects: &[Rect], margin: i64) -> usize {
    let mut seen = vec![false; rects.len()];
    let mut groups = 0;

    for start in 0..rects.len() {
        if seen[start] {
            continue;
        }
        groups += 1;
        seen[start] = true;
        let mut pending = vec![start];
        while let Some(current) = pending.pop() {
            for next in 0..rects.len() {
                if !seen[next] && rects[current].near(&rects[next], margin) {
                    seen[next] = true;
                    pending.push(next);
                }
            }
        }
    }
    groups
}

fn block_text(block: &Block) -> String {
    block
        .paragraphs
        .iter()
        .map(|paragraph| {
            paragraph
                .words
                .iter()
                .map(|word| word.symbols.iter().map(|s| s.text.as_str()).collect::<String>())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}
