//! Flattens engine-generated HTML tables so a naive single-pass renderer can
//! draw them: row/column spans become dense grids of filler and content
//! cells, multiple column groups merge into one, inline style and
//! accessibility attributes are dropped, and header rows are folded into the
//! body. Structural parse failures degrade to passing the original markup
//! through unmodified.

use memchr::memmem;

const TABLE_OPEN: &[u8] = b"<table";
const TABLE_CLOSE: &str = "</table>";
const MAX_COLSPAN: usize = 1024;

/// Rewrites every well-formed `<table>` region in `html`; anything that does
/// not parse (unterminated markup, nested tables, overlapping spans) is left
/// exactly as it was.
pub fn normalize_rich_output(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let finder = memmem::Finder::new(TABLE_OPEN);
    let mut out = String::with_capacity(html.len());
    let mut pos = 0usize;

    while let Some(rel) = finder.find(lower[pos..].as_bytes()) {
        let start = pos + rel;
        let Some(end_rel) = memmem::find(lower[start..].as_bytes(), TABLE_CLOSE.as_bytes()) else {
            // Unterminated table markup: leave the rest of the document untouched.
            break;
        };
        let end = start + end_rel + TABLE_CLOSE.len();
        out.push_str(&html[pos..start]);
        let region = &html[start..end];
        match flatten_table(region) {
            Some(flat) => out.push_str(&flat),
            None => {
                tracing::warn!("table markup could not be normalized; passing through");
                out.push_str(region);
            }
        }
        pos = end;
    }

    out.push_str(&html[pos..]);
    out
}

#[derive(Debug, Clone)]
enum Cell {
    Filler,
    Content { header: bool, inner: String },
}

#[derive(Debug)]
struct SourceCell {
    header: bool,
    rowspan: usize,
    colspan: usize,
    inner: String,
}

#[derive(Debug, Default)]
struct SourceRow {
    cells: Vec<SourceCell>,
}

#[derive(Debug)]
struct RawTag<'a> {
    name: String,
    attrs: &'a str,
    is_close: bool,
    end: usize,
}

fn scan_tag(input: &str, from: usize) -> Option<RawTag<'_>> {
    let open_rel = input[from..].find('<')?;
    let start = from + open_rel;
    let close_rel = input[start..].find('>')?;
    let end = start + close_rel + 1;
    let inner = &input[start + 1..end - 1];

    if inner.starts_with('!') {
        // Comment or doctype: opaque, no name.
        return Some(RawTag {
            name: String::new(),
            attrs: "",
            is_close: false,
            end,
        });
    }

    let (is_close, body) = match inner.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let body = body.trim_end_matches('/');
    let name_end = body
        .find(|c: char| c.is_whitespace())
        .unwrap_or(body.len());
    Some(RawTag {
        name: body[..name_end].to_ascii_lowercase(),
        attrs: &body[name_end..],
        is_close,
        end,
    })
}

fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let lower = attrs.to_ascii_lowercase();
    let mut search = 0usize;
    while let Some(rel) = lower[search..].find(name) {
        let at = search + rel;
        let boundary_before = at == 0
            || !(lower.as_bytes()[at - 1].is_ascii_alphanumeric()
                || lower.as_bytes()[at - 1] == b'-');
        let after = attrs[at + name.len()..].trim_start();
        if boundary_before && after.starts_with('=') {
            let value = after[1..].trim_start();
            if let Some(rest) = value.strip_prefix('"') {
                return Some(rest[..rest.find('"')?].to_string());
            }
            if let Some(rest) = value.strip_prefix('\'') {
                return Some(rest[..rest.find('\'')?].to_string());
            }
            let bare = value
                .split(|c: char| c.is_whitespace() || c == '/' || c == '>')
                .next()
                .unwrap_or("");
            return Some(bare.to_string());
        }
        search = at + name.len();
    }
    None
}

fn attr_span(attrs: &str, name: &str) -> usize {
    attr_value(attrs, name)
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|span| *span >= 1)
        .unwrap_or(1)
}

struct ParsedTable {
    caption: Option<String>,
    rows: Vec<SourceRow>,
}

/// Parses one `<table>...</table>` region into rows in document order.
/// Header-section rows are just the first rows of the sequence; the cell
/// `header` flag records where they came from.
fn parse_table(table: &str) -> Option<ParsedTable> {
    let mut rows: Vec<SourceRow> = Vec::new();
    let mut current_row: Option<SourceRow> = None;
    let mut caption: Option<String> = None;
    let mut in_header_section = false;
    let mut saw_table_open = false;
    let mut pos = 0usize;

    while let Some(tag) = scan_tag(table, pos) {
        pos = tag.end;
        match tag.name.as_str() {
            "table" => {
                if tag.is_close {
                    break;
                }
                if saw_table_open {
                    // Nested tables are beyond a flat grid; degrade.
                    return None;
                }
                saw_table_open = true;
            }
            "caption" if !tag.is_close => {
                let close = find_close_tag(table, pos, "caption")?;
                caption = Some(table[pos..close].trim().to_string());
                pos = find_tag_end(table, close)?;
            }
            "thead" => in_header_section = !tag.is_close,
            "tbody" | "tfoot" | "colgroup" | "col" => {}
            "tr" => {
                if tag.is_close {
                    rows.push(current_row.take()?);
                } else {
                    if current_row.is_some() {
                        return None;
                    }
                    current_row = Some(SourceRow::default());
                }
            }
            "th" | "td" => {
                if tag.is_close {
                    return None;
                }
                let row = current_row.as_mut()?;
                let close = find_close_tag(table, pos, &tag.name)?;
                let inner = table[pos..close].trim().to_string();
                let class_header = attr_value(tag.attrs, "class")
                    .is_some_and(|classes| classes.split_whitespace().any(|c| c == "header"));
                row.cells.push(SourceCell {
                    header: tag.name == "th" || in_header_section || class_header,
                    rowspan: attr_span(tag.attrs, "rowspan"),
                    colspan: attr_span(tag.attrs, "colspan"),
                    inner,
                });
                pos = find_tag_end(table, close)?;
            }
            _ => {}
        }
    }

    if !saw_table_open || current_row.is_some() {
        return None;
    }
    Some(ParsedTable { caption, rows })
}

/// Byte offset of the `</name>` closing the element whose content starts at
/// `from`. Valid because nested tables were already ruled out, so cell
/// content cannot contain another cell of the same name.
fn find_close_tag(table: &str, from: usize, name: &str) -> Option<usize> {
    let needle = format!("</{name}");
    let lower = table.to_ascii_lowercase();
    memmem::find(lower[from..].as_bytes(), needle.as_bytes()).map(|rel| from + rel)
}

fn find_tag_end(table: &str, tag_start: usize) -> Option<usize> {
    table[tag_start..].find('>').map(|rel| tag_start + rel + 1)
}

/// Places each source cell into a dense grid. A cell spanning `r` rows and
/// `c` columns occupies all `r x c` slots; its content lands in the first
/// column of the span on the span's *last* row (bottom alignment, matching
/// how the source renders before flattening) and every other slot holds a
/// filler cell.
fn build_grid(rows: &[SourceRow]) -> Option<Vec<Vec<Cell>>> {
    let nrows = rows.len();
    let mut grid: Vec<Vec<Option<Cell>>> = vec![Vec::new(); nrows];

    for (r, row) in rows.iter().enumerate() {
        let mut col = 0usize;
        for cell in &row.cells {
            while matches!(grid[r].get(col), Some(Some(_))) {
                col += 1;
            }
            let rowspan = cell.rowspan.min(nrows - r);
            // Bound the declared width so a corrupt span attribute cannot
            // allocate an absurd grid.
            let colspan = cell.colspan.min(MAX_COLSPAN);
            for rr in 0..rowspan {
                let slots = &mut grid[r + rr];
                if slots.len() < col + colspan {
                    slots.resize(col + colspan, None);
                }
                for cc in 0..colspan {
                    let slot = &mut slots[col + cc];
                    if slot.is_some() {
                        // Overlapping spans: malformed.
                        return None;
                    }
                    let is_anchor = rr + 1 == rowspan && cc == 0;
                    *slot = Some(if is_anchor {
                        Cell::Content {
                            header: cell.header,
                            inner: cell.inner.clone(),
                        }
                    } else {
                        Cell::Filler
                    });
                }
            }
            col += colspan;
        }
    }

    let width = grid.iter().map(Vec::len).max().unwrap_or(0);
    Some(
        grid.into_iter()
            .map(|row| {
                let mut dense: Vec<Cell> = row
                    .into_iter()
                    .map(|slot| slot.unwrap_or(Cell::Filler))
                    .collect();
                dense.resize_with(width, || Cell::Filler);
                dense
            })
            .collect(),
    )
}

/// Serializes the grid as a single span-free table: one column group for the
/// full width, one body, header cells kept as `<th class="header">` (the one
/// attribute preserved, since downstream styling keys on it).
fn serialize_grid(caption: Option<&str>, grid: &[Vec<Cell>]) -> String {
    let width = grid.first().map(Vec::len).unwrap_or(0);
    let mut out = String::new();
    out.push_str("<table>\n");
    if let Some(caption) = caption {
        out.push_str("<caption>");
        out.push_str(caption);
        out.push_str("</caption>\n");
    }
    out.push_str(&format!("<colgroup span=\"{width}\"></colgroup>\n"));
    out.push_str("<tbody>\n");
    for row in grid {
        out.push_str("<tr>");
        for cell in row {
            match cell {
                Cell::Filler => out.push_str("<td></td>"),
                Cell::Content { header: true, inner } => {
                    out.push_str("<th class=\"header\">");
                    out.push_str(inner);
                    out.push_str("</th>");
                }
                Cell::Content {
                    header: false,
                    inner,
                } => {
                    out.push_str("<td>");
                    out.push_str(inner);
                    out.push_str("</td>");
                }
            }
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</tbody>\n</table>");
    out
}

fn flatten_table(table: &str) -> Option<String> {
    // A region holds exactly one table open by construction; a second one
    // means nesting, which a flat grid cannot represent.
    let lower = table.to_ascii_lowercase();
    if memmem::find_iter(lower.as_bytes(), TABLE_OPEN).count() > 1 {
        return None;
    }
    let parsed = parse_table(table)?;
    let grid = build_grid(&parsed.rows)?;
    Some(serialize_grid(parsed.caption.as_deref(), &grid))
}
