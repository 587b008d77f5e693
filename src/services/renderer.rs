// src/services/renderer.rs
//! Document rendering seam.
//!
//! The signing core does not draw PDFs. It turns a workflow's completed
//! signers into a [`Mark`] plan in PDF points and hands plan plus base file to
//! a [`DocumentRenderer`]. Only completed signers contribute marks, and the
//! plan depends only on the signer snapshot, so rendering the same state twice
//! yields the same output.

use crate::models::workflow::{FieldKind, Signer};
use crate::utils::serialization::decode_data_url;
use log::debug;
use std::path::Path;
use thiserror::Error;

/// Placement UI pixels per PDF point.
pub const VIEWPORT_SCALE: f64 = 1.2;
/// Field size used when a placement has no usable width.
pub const DEFAULT_FIELD_WIDTH: f64 = 140.0;
/// Field size used when a placement has no usable height.
pub const DEFAULT_FIELD_HEIGHT: f64 = 40.0;
/// Starting font size for text marks.
pub const DEFAULT_FONT_SIZE: f64 = 12.0;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("cannot read base document: {0}")]
    Io(#[from] std::io::Error),
}

/// Colour with components in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0.0, g: 0.0, b: 0.0 };

    /// Parses `#rrggbb` (or `rrggbb`). Anything else is black.
    pub fn from_hex(value: &str) -> Rgb {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 {
            return Rgb::BLACK;
        }
        match hex::decode(hex) {
            Ok(bytes) => Rgb {
                r: f64::from(bytes[0]) / 255.0,
                g: f64::from(bytes[1]) / 255.0,
                b: f64::from(bytes[2]) / 255.0,
            },
            Err(_) => Rgb::BLACK,
        }
    }
}

/// Rectangle in PDF points, origin top-left of the page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkContent {
    /// Decoded image bytes from a `data:image/...` value
    Image { mime: String, data: Vec<u8> },
    Text { text: String, font: Option<String>, size: f64 },
}

/// One thing to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct Mark {
    pub signer_id: String,
    pub field_id: String,
    pub kind: FieldKind,
    /// 1-based
    pub page: u32,
    pub rect: Rect,
    pub color: Rgb,
    pub content: MarkContent,
}

fn or_default(value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        default
    }
}

/// Builds the draw list for a signer snapshot.
///
/// Pending signers and empty values are skipped. A `data:image/...` value
/// whose payload does not decode is skipped as well.
pub fn render_plan(signers: &[Signer]) -> Vec<Mark> {
    let mut marks = Vec::new();
    for signer in signers.iter().filter(|s| s.is_completed()) {
        for field in &signer.fields {
            let Some(value) = field.value.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
                continue;
            };

            let rect = Rect {
                x: field.x.max(0.0) / VIEWPORT_SCALE,
                top: field.y.max(0.0) / VIEWPORT_SCALE,
                width: or_default(field.width, DEFAULT_FIELD_WIDTH) / VIEWPORT_SCALE,
                height: or_default(field.height, DEFAULT_FIELD_HEIGHT) / VIEWPORT_SCALE,
            };

            let content = if value.starts_with("data:image") {
                match decode_data_url(value) {
                    Some((mime, data)) => MarkContent::Image { mime, data },
                    None => {
                        debug!("Skipping undecodable image in field {}", field.id);
                        continue;
                    }
                }
            } else {
                MarkContent::Text {
                    text: value.to_string(),
                    font: if field.kind.is_handwritten() { field.font.clone() } else { None },
                    size: DEFAULT_FONT_SIZE,
                }
            };

            marks.push(Mark {
                signer_id: signer.id.clone(),
                field_id: field.id.clone(),
                kind: field.kind,
                page: field.page.max(1),
                rect,
                color: field.color.as_deref().map(Rgb::from_hex).unwrap_or(Rgb::BLACK),
                content,
            });
        }
    }
    marks
}

/// Produces final PDF bytes from a base document and completed signers.
///
/// Implementations run on a blocking thread.
pub trait DocumentRenderer: Send + Sync {
    fn render(
        &self,
        base_pdf_path: &Path,
        signers: &[Signer],
        workflow_id: &str,
    ) -> Result<Vec<u8>, RenderError>;
}

/// Returns the base document unchanged.
///
/// Used when no compositing backend is configured; the plan is still built and
/// logged so the snapshot handed over is the one a real backend would see.
pub struct PassthroughRenderer;

impl DocumentRenderer for PassthroughRenderer {
    fn render(
        &self,
        base_pdf_path: &Path,
        signers: &[Signer],
        workflow_id: &str,
    ) -> Result<Vec<u8>, RenderError> {
        let plan = render_plan(signers);
        debug!(
            "Rendering workflow {} with {} marks (pass-through)",
            workflow_id,
            plan.len()
        );
        Ok(std::fs::read(base_pdf_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::{Field, SignerStatus};
    use chrono::Utc;

    fn field(id: &str, kind: FieldKind, value: Option<&str>) -> Field {
        Field {
            id: id.into(),
            kind,
            x: 120.0,
            y: 240.0,
            width: 168.0,
            height: 48.0,
            page: 2,
            required: true,
            value: value.map(String::from),
            color: Some("#000080".into()),
            font: Some("Dancing Script".into()),
        }
    }

    fn signer(status: SignerStatus, fields: Vec<Field>) -> Signer {
        Signer {
            id: "s-1".into(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            seq: 1,
            status,
            fields,
            signed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_pending_signers_contribute_nothing() {
        let pending = signer(SignerStatus::Pending, vec![field("f", FieldKind::Text, Some("x"))]);
        assert!(render_plan(&[pending]).is_empty());
    }

    #[test]
    fn test_text_mark_geometry() {
        let done = signer(SignerStatus::Completed, vec![field("f", FieldKind::Text, Some(" ACME Ltd "))]);
        let plan = render_plan(&[done]);
        assert_eq!(plan.len(), 1);

        let mark = &plan[0];
        assert_eq!(mark.page, 2);
        assert!((mark.rect.x - 100.0).abs() < 1e-9);
        assert!((mark.rect.top - 200.0).abs() < 1e-9);
        assert!((mark.rect.width - 140.0).abs() < 1e-9);
        assert!((mark.rect.height - 40.0).abs() < 1e-9);
        assert!((mark.color.b - 128.0 / 255.0).abs() < 1e-9);
        assert!(matches!(&mark.content, MarkContent::Text { text, font: None, .. } if text == "ACME Ltd"));
    }

    #[test]
    fn test_typed_signature_keeps_font() {
        let done = signer(SignerStatus::Completed, vec![field("f", FieldKind::Signature, Some("Ada L."))]);
        let plan = render_plan(&[done]);
        assert!(matches!(
            &plan[0].content,
            MarkContent::Text { font: Some(font), .. } if font == "Dancing Script"
        ));
    }

    #[test]
    fn test_image_marks_and_skips() {
        let done = signer(
            SignerStatus::Completed,
            vec![
                field("img", FieldKind::Signature, Some("data:image/png;base64,iVBORw0KGgo=")),
                field("bad", FieldKind::Signature, Some("data:image/png;base64,@@@")),
                field("empty", FieldKind::Date, Some("   ")),
                field("none", FieldKind::Initials, None),
            ],
        );
        let plan = render_plan(&[done]);
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0].content, MarkContent::Image { mime, .. } if mime == "image/png"));
    }

    #[test]
    fn test_missing_size_uses_default_box() {
        let mut f = field("f", FieldKind::Text, Some("x"));
        f.width = 0.0;
        f.height = -3.0;
        let plan = render_plan(&[signer(SignerStatus::Completed, vec![f])]);
        assert!((plan[0].rect.width - DEFAULT_FIELD_WIDTH / VIEWPORT_SCALE).abs() < 1e-9);
        assert!((plan[0].rect.height - DEFAULT_FIELD_HEIGHT / VIEWPORT_SCALE).abs() < 1e-9);
    }

    #[test]
    fn test_colour_parsing() {
        assert_eq!(Rgb::from_hex("nonsense"), Rgb::BLACK);
        assert_eq!(Rgb::from_hex("#zzzzzz"), Rgb::BLACK);
        assert_eq!(Rgb::from_hex("#ffffff"), Rgb { r: 1.0, g: 1.0, b: 1.0 });
    }

    #[test]
    fn test_passthrough_returns_base_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.pdf");
        std::fs::write(&path, b"%PDF-1.4 base").unwrap();
        let bytes = PassthroughRenderer.render(&path, &[], "wf").unwrap();
        assert_eq!(bytes, b"%PDF-1.4 base".to_vec());
        assert!(matches!(
            PassthroughRenderer.render(&dir.path().join("missing.pdf"), &[], "wf"),
            Err(RenderError::Io(_))
        ));
    }
}
