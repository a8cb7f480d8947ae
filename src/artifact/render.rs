//! PDF rendering.

use thiserror::Error;

use crate::plan::display_text;
use crate::trip::ResolvedLocation;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Render failed: {0}")]
    Failed(String),
}

/// Turns plan content and resolved locations into PDF bytes.
///
/// Rendering is CPU-bound; callers run it on a blocking thread.
pub trait PdfRenderer: Send + Sync {
    fn render(&self, content: &str, locations: &[ResolvedLocation]) -> Result<Vec<u8>, RenderError>;
}

const LINES_PER_PAGE: usize = 52;
const WRAP_COLUMNS: usize = 92;

/// Plain-text PDF: one Helvetica page stream per 52 lines, followed by a
/// places section listing every location with its details and a map link.
#[derive(Debug, Default, Clone)]
pub struct TextPdfRenderer;

impl TextPdfRenderer {
    fn lines(content: &str, locations: &[ResolvedLocation]) -> Vec<String> {
        let mut lines = Vec::new();
        for raw in display_text(content).lines() {
            wrap_into(&mut lines, &latin1_only(raw));
        }

        if !locations.is_empty() {
            lines.push(String::new());
            lines.push("Places".to_string());
            lines.push(String::new());
            for location in locations {
                wrap_into(&mut lines, &latin1_only(&format!("* {}", location.name)));
                if let Some(place) = &location.place {
                    if let Some(address) = &place.address {
                        wrap_into(&mut lines, &latin1_only(&format!("    {}", address)));
                    }
                    if let Some(rating) = place.rating {
                        lines.push(format!("    Rating: {:.1}/5", rating));
                    }
                }
                wrap_into(&mut lines, &format!("    {}", location.maps_link(None)));
            }
        }
        lines
    }
}

impl PdfRenderer for TextPdfRenderer {
    fn render(&self, content: &str, locations: &[ResolvedLocation]) -> Result<Vec<u8>, RenderError> {
        if content.trim().is_empty() {
            return Err(RenderError::Failed("empty plan content".to_string()));
        }
        let lines = Self::lines(content, locations);
        let pages: Vec<&[String]> = lines.chunks(LINES_PER_PAGE).collect();
        Ok(build_pdf(&pages))
    }
}

/// Drop characters Helvetica's WinAnsi encoding cannot show (emoji and the
/// like), collapsing the whitespace they leave behind.
fn latin1_only(line: &str) -> String {
    let leading = line.chars().take_while(|c| *c == ' ').count();
    let kept: String = line
        .chars()
        .filter(|c| (*c as u32) <= 0xFF && (*c == ' ' || !c.is_control()))
        .collect();
    let body = kept.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{}{}", " ".repeat(leading.min(8)), body)
}

fn wrap_into(out: &mut Vec<String>, line: &str) {
    if line.chars().count() <= WRAP_COLUMNS {
        out.push(line.to_string());
        return;
    }
    let mut current = String::new();
    for word in line.split(' ') {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > WRAP_COLUMNS {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        out.push(current);
    }
}

/// Escape a line for a PDF literal string; non-ASCII Latin-1 goes out as
/// octal escapes so the content stream stays ASCII.
fn pdf_string(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + 2);
    for c in line.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x80 => out.push(c),
            c => out.push_str(&format!("\\{:03o}", c as u32)),
        }
    }
    out
}

fn build_pdf(pages: &[&[String]]) -> Vec<u8> {
    let mut out: Vec<u8> = b"%PDF-1.4\n".to_vec();
    let mut offsets: Vec<usize> = Vec::new();

    let mut push_object = |out: &mut Vec<u8>, id: usize, body: &str| {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", id, body).as_bytes());
    };

    let kids = (0..pages.len())
        .map(|i| format!("{} 0 R", 4 + 2 * i))
        .collect::<Vec<_>>()
        .join(" ");

    push_object(&mut out, 1, "<< /Type /Catalog /Pages 2 0 R >>");
    push_object(
        &mut out,
        2,
        &format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids, pages.len()),
    );
    push_object(
        &mut out,
        3,
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>",
    );

    for (i, page) in pages.iter().enumerate() {
        let page_id = 4 + 2 * i;
        let content_id = page_id + 1;

        let mut stream = String::from("BT\n/F1 10 Tf\n14 TL\n50 800 Td\n");
        for line in page.iter() {
            stream.push_str(&format!("({}) Tj T*\n", pdf_string(line)));
        }
        stream.push_str("ET");

        push_object(
            &mut out,
            page_id,
            &format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 595 842] \
                 /Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
                content_id
            ),
        );
        push_object(
            &mut out,
            content_id,
            &format!(
                "<< /Length {} >>\nstream\n{}\nendstream",
                stream.len(),
                stream
            ),
        );
    }

    let xref_at = out.len();
    let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", offsets.len() + 1);
    for offset in &offsets {
        xref.push_str(&format!("{:010} 00000 n \n", offset));
    }
    xref.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
        offsets.len() + 1,
        xref_at
    ));
    out.extend_from_slice(xref.as_bytes());
    out
}
