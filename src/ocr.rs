//! Screenshot Tier Classification
//!
//! Reads a bandwidth amount out of a dashboard screenshot with tesseract and
//! maps it onto a contribution tier. A failed, timed-out or low-confidence
//! read is a fallback value, never an error: the caller drops to manual tier
//! selection instead of guessing. Frames are written to a temp path only for
//! the duration of one recognition pass and removed on every exit path;
//! recognized text is returned to the caller but never persisted or logged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, warn};

use crate::progression::{classify_tier, TierBand};

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("tesseract not available: {0}")]
    Unavailable(String),
    #[error("recognition failed: {0}")]
    Recognition(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Text plus the mean word confidence tesseract reported for it.
#[derive(Debug, Clone)]
pub struct RecognizedText {
    pub text: String,
    pub mean_confidence: f64,
}

/// Outcome of one screenshot classification.
#[derive(Debug, Clone)]
pub struct TierReading {
    /// True when a tier was determined at or above the confidence gate.
    pub success: bool,
    pub tier: Option<&'static TierBand>,
    pub amount_gb: Option<f64>,
    pub confidence: f64,
    /// True when the caller should fall back to manual tier selection.
    pub should_fallback: bool,
    /// Recognized text, for the caller's manual-review path. Never logged.
    pub raw_text: String,
}

impl TierReading {
    fn fallback() -> Self {
        Self {
            success: false,
            tier: None,
            amount_gb: None,
            confidence: 0.0,
            should_fallback: true,
            raw_text: String::new(),
        }
    }
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// One-time availability check; classification falls back when false.
    async fn probe(&self) -> bool {
        true
    }

    async fn recognize(&self, image_path: &Path) -> Result<RecognizedText, OcrError>;
}

// ============================================================================
// TESSERACT CLI
// ============================================================================

/// Recognizer backed by the tesseract binary in TSV mode.
pub struct TesseractCli {
    cmd: String,
}

impl TesseractCli {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

#[async_trait]
impl TextRecognizer for TesseractCli {
    async fn probe(&self) -> bool {
        match tokio::process::Command::new(&self.cmd)
            .arg("--version")
            .output()
            .await
        {
            Ok(output) if output.status.success() => true,
            Ok(_) => {
                warn!("tesseract probe exited nonzero");
                false
            }
            Err(e) => {
                warn!("tesseract not available: {}", e);
                false
            }
        }
    }

    async fn recognize(&self, image_path: &Path) -> Result<RecognizedText, OcrError> {
        let output = tokio::process::Command::new(&self.cmd)
            .arg(image_path)
            .arg("stdout")
            .arg("--psm")
            .arg("6")
            .arg("-l")
            .arg("eng")
            .arg("tsv")
            .output()
            .await
            .map_err(|e| OcrError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(OcrError::Recognition(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse tesseract TSV output: one word per row, confidence in column 11,
/// text in column 12. Rows with no confidence (structural rows) are skipped;
/// overall confidence is the integer mean of the word confidences.
fn parse_tsv(tsv: &str) -> RecognizedText {
    let mut text = String::new();
    let mut confidences: Vec<f64> = Vec::new();
    let mut last_line_key: Option<(String, String, String)> = None;

    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let conf: f64 = cols[10].parse().unwrap_or(-1.0);
        let word = cols[11].trim();
        if conf <= 0.0 || word.is_empty() {
            continue;
        }

        let key = (
            cols[2].to_string(),
            cols[3].to_string(),
            cols[4].to_string(),
        );
        if let Some(prev) = &last_line_key {
            if *prev == key {
                text.push(' ');
            } else {
                text.push('\n');
            }
        }
        last_line_key = Some(key);

        text.push_str(word);
        confidences.push(conf);
    }

    let mean_confidence = if confidences.is_empty() {
        0.0
    } else {
        (confidences.iter().sum::<f64>() / confidences.len() as f64).trunc()
    };

    RecognizedText {
        text,
        mean_confidence,
    }
}

// ============================================================================
// AMOUNT EXTRACTION
// ============================================================================

lazy_static! {
    /// Amount next to a contribution keyword, e.g. "Bandwidth shared: 37.5 GB".
    static ref KEYWORD_AMOUNT: Regex = Regex::new(
        r"(?i)(?:total|shared|sent|uploaded|data|traffic|bandwidth)\D{0,40}?([0-9OoIlS][0-9OoIlS.,]*)\s*(GB|MB|TB)\b"
    )
    .expect("invalid keyword amount pattern");

    static ref GB_AMOUNT: Regex =
        Regex::new(r"(?i)\b([0-9OoIlS][0-9OoIlS.,]*)\s*GB\b").expect("invalid GB pattern");
    static ref MB_AMOUNT: Regex =
        Regex::new(r"(?i)\b([0-9OoIlS][0-9OoIlS.,]*)\s*MB\b").expect("invalid MB pattern");
    static ref TB_AMOUNT: Regex =
        Regex::new(r"(?i)\b([0-9OoIlS][0-9OoIlS.,]*)\s*TB\b").expect("invalid TB pattern");
}

/// Find the shared-bandwidth amount in recognized text, in GB. An amount
/// next to a contribution keyword wins; without one, the first GB amount is
/// taken, then MB, then TB.
pub fn extract_gb(text: &str) -> Option<f64> {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Some(caps) = KEYWORD_AMOUNT.captures(&flat) {
        if let Some(gb) = amount_to_gb(&caps[1], &caps[2]) {
            return Some(gb);
        }
    }

    if let Some(caps) = GB_AMOUNT.captures(&flat) {
        if let Some(value) = parse_amount(&caps[1]) {
            return Some(value);
        }
    }
    if let Some(caps) = MB_AMOUNT.captures(&flat) {
        if let Some(value) = parse_amount(&caps[1]) {
            return Some(value / 1024.0);
        }
    }
    if let Some(caps) = TB_AMOUNT.captures(&flat) {
        if let Some(value) = parse_amount(&caps[1]) {
            return Some(value * 1024.0);
        }
    }

    None
}

fn amount_to_gb(number: &str, unit: &str) -> Option<f64> {
    let value = parse_amount(number)?;
    match unit.to_ascii_uppercase().as_str() {
        "GB" => Some(value),
        "MB" => Some(value / 1024.0),
        "TB" => Some(value * 1024.0),
        _ => None,
    }
}

fn parse_amount(token: &str) -> Option<f64> {
    let value: f64 = clean_digits(token).parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value)
}

/// Undo digit confusions tesseract makes in numeric tokens. Applied only to
/// the captured number, never to surrounding text.
pub fn clean_digits(token: &str) -> String {
    token
        .chars()
        .filter_map(|c| match c {
            'O' | 'o' => Some('0'),
            'l' | 'I' => Some('1'),
            'S' => Some('5'),
            ',' => Some('.'),
            c if c.is_ascii_digit() || c == '.' => Some(c),
            _ => None,
        })
        .collect()
}

// ============================================================================
// TIER VERIFIER
// ============================================================================

/// Temp frame that removes itself when recognition is done.
struct TempImage {
    path: PathBuf,
}

impl TempImage {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("ocr-{}.png", uuid::Uuid::new_v4()));
        Self { path }
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Failed to remove temp frame: {}", e);
            }
        }
    }
}

/// Classifies screenshots end to end: preprocess, recognize, parse the
/// amount and gate the result on confidence.
pub struct TierVerifier {
    recognizer: Arc<dyn TextRecognizer>,
    confidence_threshold: f64,
    jobs: Arc<Semaphore>,
    timeout: Duration,
    available: OnceCell<bool>,
}

impl TierVerifier {
    pub fn new(
        recognizer: Arc<dyn TextRecognizer>,
        confidence_threshold: f64,
        max_concurrent_jobs: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            recognizer,
            confidence_threshold,
            jobs: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            timeout,
            available: OnceCell::new(),
        }
    }

    /// Run one screenshot through recognition. The frame bytes live on disk
    /// only while tesseract needs them; preprocessing and recognition share
    /// one wall-clock budget so a pathological frame cannot pin a job slot.
    pub async fn classify_screenshot(&self, image_bytes: &[u8]) -> TierReading {
        let _permit = match self.jobs.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return TierReading::fallback(),
        };

        let available = *self
            .available
            .get_or_init(|| async { self.recognizer.probe().await })
            .await;
        if !available {
            warn!("Recognizer unavailable; falling back to manual tier selection");
            return TierReading::fallback();
        }

        let frame = TempImage::new();
        let staged = tokio::time::timeout(self.timeout, async {
            let prepared = {
                let bytes = image_bytes.to_vec();
                let path = frame.path.clone();
                tokio::task::spawn_blocking(move || -> Result<(), OcrError> {
                    preprocess(&bytes)?.save(&path)?;
                    Ok(())
                })
                .await
            };
            let prep_err = match prepared {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = prep_err {
                // A frame tesseract can still read beats a hard failure.
                warn!("Preprocess failed ({}), recognizing the original frame", reason);
                tokio::fs::write(&frame.path, image_bytes).await?;
            }
            self.recognizer.recognize(&frame.path).await
        })
        .await;

        let recognized = match staged {
            Ok(Ok(recognized)) => recognized,
            Ok(Err(e)) => {
                warn!("Recognition failed: {}", e);
                return TierReading::fallback();
            }
            Err(_) => {
                warn!("Recognition timed out after {:?}", self.timeout);
                return TierReading::fallback();
            }
        };
        drop(frame);

        let amount_gb = extract_gb(&recognized.text);
        let tier = amount_gb.and_then(classify_tier);
        let confident = recognized.mean_confidence >= self.confidence_threshold;

        debug!(
            "Screenshot read at {:.0}% confidence: {:?} GB -> {:?}",
            recognized.mean_confidence,
            amount_gb,
            tier.map(|band| band.label)
        );

        TierReading {
            success: confident && tier.is_some(),
            tier,
            amount_gb,
            confidence: recognized.mean_confidence,
            // No tier means no answer, even when the read itself was clean.
            should_fallback: !confident || tier.is_none(),
            raw_text: recognized.text,
        }
    }
}

/// Clean a frame up for recognition. Dashboards are dark-themed and low
/// contrast more often than not.
fn preprocess(bytes: &[u8]) -> Result<image::DynamicImage, OcrError> {
    let img = image::load_from_memory(bytes)?;
    // ~2x contrast boost
    let img = img
        .grayscale()
        .adjust_contrast(85.0)
        .filter3x3(&[0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0])
        .brighten(10);
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsv_row(block: u32, par: u32, line: u32, conf: f64, word: &str) -> String {
        format!("5\t1\t{block}\t{par}\t{line}\t1\t0\t0\t10\t10\t{conf}\t{word}")
    }

    const TSV_HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_parse_tsv_joins_words_and_lines() {
        let tsv = [
            TSV_HEADER.to_string(),
            tsv_row(1, 1, 1, 90.0, "Bandwidth"),
            tsv_row(1, 1, 1, 85.0, "shared:"),
            tsv_row(1, 1, 2, 95.0, "37.5"),
            tsv_row(1, 1, 2, 90.0, "GB"),
        ]
        .join("\n");

        let recognized = parse_tsv(&tsv);
        assert_eq!(recognized.text, "Bandwidth shared:\n37.5 GB");
        assert_eq!(recognized.mean_confidence, 90.0);
    }

    #[test]
    fn test_parse_tsv_integer_mean() {
        let tsv = [
            TSV_HEADER.to_string(),
            tsv_row(1, 1, 1, 90.0, "50"),
            tsv_row(1, 1, 1, 85.0, "GB"),
        ]
        .join("\n");

        // 87.5 truncates to 87
        assert_eq!(parse_tsv(&tsv).mean_confidence, 87.0);
    }

    #[test]
    fn test_parse_tsv_skips_structural_rows() {
        let tsv = [
            TSV_HEADER.to_string(),
            tsv_row(1, 1, 1, -1.0, ""),
            tsv_row(1, 1, 1, 80.0, "50"),
            tsv_row(1, 1, 1, 0.0, "noise"),
        ]
        .join("\n");

        let recognized = parse_tsv(&tsv);
        assert_eq!(recognized.text, "50");
        assert_eq!(recognized.mean_confidence, 80.0);
    }

    #[test]
    fn test_parse_tsv_empty_input() {
        let recognized = parse_tsv("");
        assert_eq!(recognized.text, "");
        assert_eq!(recognized.mean_confidence, 0.0);
    }

    #[test]
    fn test_clean_digits_confusions() {
        assert_eq!(clean_digits("3O,S"), "30.5");
        assert_eq!(clean_digits("l2I"), "121");
        assert_eq!(clean_digits("47.5"), "47.5");
        assert_eq!(clean_digits("1x2"), "12");
    }

    #[test]
    fn test_extract_gb_prefers_keyword_context() {
        let text = "Plan limit: 1000 GB\nBandwidth shared: 37.5 GB";
        assert_eq!(extract_gb(text), Some(37.5));
    }

    #[test]
    fn test_extract_gb_normalizes_units() {
        assert_eq!(extract_gb("shared 512 MB"), Some(0.5));
        assert_eq!(extract_gb("shared 2 TB"), Some(2048.0));
    }

    #[test]
    fn test_extract_gb_unit_priority_without_keyword() {
        // GB matches win over MB even when MB comes first in the text.
        assert_eq!(extract_gb("800 MB cache, 3 GB quota"), Some(3.0));
        assert_eq!(extract_gb("5 GB free, 80 GB used"), Some(5.0));
    }

    #[test]
    fn test_extract_gb_collapses_whitespace() {
        assert_eq!(extract_gb("Bandwidth   shared:\n 42 GB"), Some(42.0));
    }

    #[test]
    fn test_extract_gb_confused_digits() {
        assert_eq!(extract_gb("Shared: 5O GB"), Some(50.0));
    }

    #[test]
    fn test_extract_gb_nothing_found() {
        assert_eq!(extract_gb("no numbers here"), None);
        assert_eq!(extract_gb(""), None);
    }

    struct StubRecognizer {
        text: &'static str,
        confidence: f64,
        available: bool,
    }

    #[async_trait]
    impl TextRecognizer for StubRecognizer {
        async fn probe(&self) -> bool {
            self.available
        }

        async fn recognize(&self, _image_path: &Path) -> Result<RecognizedText, OcrError> {
            Ok(RecognizedText {
                text: self.text.to_string(),
                mean_confidence: self.confidence,
            })
        }
    }

    struct StallingRecognizer;

    #[async_trait]
    impl TextRecognizer for StallingRecognizer {
        async fn recognize(&self, _image_path: &Path) -> Result<RecognizedText, OcrError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(RecognizedText {
                text: String::new(),
                mean_confidence: 0.0,
            })
        }
    }

    fn verifier(text: &'static str, confidence: f64) -> TierVerifier {
        TierVerifier::new(
            Arc::new(StubRecognizer {
                text,
                confidence,
                available: true,
            }),
            60.0,
            2,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_classify_screenshot_determines_tier() {
        let v = verifier("Bandwidth shared: 75 GB", 88.0);
        let reading = v.classify_screenshot(b"not a real image").await;
        assert!(reading.success);
        assert!(!reading.should_fallback);
        assert_eq!(reading.tier.map(|band| band.label), Some("51-100"));
        assert_eq!(reading.amount_gb, Some(75.0));
        assert_eq!(reading.confidence, 88.0);
        assert_eq!(reading.raw_text, "Bandwidth shared: 75 GB");
    }

    #[tokio::test]
    async fn test_classify_screenshot_low_confidence_keeps_amount() {
        let v = verifier("Bandwidth shared: 75 GB", 30.0);
        let reading = v.classify_screenshot(b"not a real image").await;
        assert!(!reading.success);
        assert!(reading.should_fallback);
        assert_eq!(reading.amount_gb, Some(75.0));
        assert_eq!(reading.confidence, 30.0);
    }

    #[tokio::test]
    async fn test_classify_screenshot_below_minimum_falls_back() {
        let v = verifier("shared 0.5 GB", 90.0);
        let reading = v.classify_screenshot(b"not a real image").await;
        assert!(!reading.success);
        assert!(reading.should_fallback);
        assert!(reading.tier.is_none());
        // The amount survives so the manual path can prefill it.
        assert_eq!(reading.amount_gb, Some(0.5));
    }

    #[tokio::test]
    async fn test_classify_screenshot_no_amount_falls_back() {
        let v = verifier("nothing useful", 90.0);
        let reading = v.classify_screenshot(b"not a real image").await;
        assert!(!reading.success);
        assert!(reading.should_fallback);
        assert!(reading.amount_gb.is_none());
    }

    #[tokio::test]
    async fn test_classify_screenshot_unavailable_recognizer_falls_back() {
        let v = TierVerifier::new(
            Arc::new(StubRecognizer {
                text: "Bandwidth shared: 75 GB",
                confidence: 90.0,
                available: false,
            }),
            60.0,
            2,
            Duration::from_secs(5),
        );
        let reading = v.classify_screenshot(b"not a real image").await;
        assert!(!reading.success);
        assert!(reading.should_fallback);
        assert_eq!(reading.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_classify_screenshot_enforces_job_deadline() {
        let v = TierVerifier::new(
            Arc::new(StallingRecognizer),
            60.0,
            2,
            Duration::from_millis(50),
        );
        let started = std::time::Instant::now();
        let reading = v.classify_screenshot(b"not a real image").await;
        assert!(!reading.success);
        assert!(reading.should_fallback);
        assert_eq!(reading.confidence, 0.0);
        // The stub stalls for 30s; the deadline has to cut the job short.
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
