//! Positional XLSX workbook reader.
//!
//! The Knowledge Base storage contract is row/column addressed (row 1 =
//! display names, row 2 = product identifiers, column A = error codes), so
//! unlike a plain text extractor this reader preserves cell positions. It
//! also resolves drawing anchors so an image embedded at a specific cell
//! can be attached to the solution extracted from that cell.
//!
//! Parsing is streaming `quick-xml` over bounded `zip` entries. Both shared
//! strings (`t="s"`) and inline strings (`t="inlineStr"`) are supported;
//! rich-text runs inside one `<si>`/`<is>` are concatenated.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum cells to process per sheet (avoids unbounded memory).
const MAX_CELLS_PER_SHEET: usize = 100_000;

#[derive(Debug)]
pub enum WorkbookError {
    Io(String),
    Archive(String),
    Xml(String),
}

impl std::fmt::Display for WorkbookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkbookError::Io(e) => write!(f, "workbook read failed: {}", e),
            WorkbookError::Archive(e) => write!(f, "workbook archive invalid: {}", e),
            WorkbookError::Xml(e) => write!(f, "workbook XML invalid: {}", e),
        }
    }
}

impl std::error::Error for WorkbookError {}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

/// One worksheet: a dense row-major grid of cell strings plus images keyed
/// by the (row, col) cell they are anchored to. Indices are 0-based.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
    images: HashMap<(usize, usize), Vec<u8>>,
}

impl Sheet {
    /// Cell text at (row, col), empty string for absent cells.
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Number of columns in the widest row.
    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Image bytes anchored exactly at (row, col), if any.
    pub fn image_at(&self, row: usize, col: usize) -> Option<&[u8]> {
        self.images.get(&(row, col)).map(Vec::as_slice)
    }
}

/// An in-memory workbook: all sheets fully materialized at load time.
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self, WorkbookError> {
        let bytes = std::fs::read(path).map_err(|e| WorkbookError::Io(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WorkbookError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| WorkbookError::Archive(e.to_string()))?;

        let shared = read_shared_strings(&mut archive)?;
        let sheet_index = read_sheet_index(&mut archive)?;
        let workbook_rels = read_rels(&mut archive, "xl/_rels/workbook.xml.rels")?;

        let mut sheets = Vec::with_capacity(sheet_index.len());
        for (name, rid) in sheet_index {
            let Some(target) = workbook_rels.get(&rid) else {
                continue;
            };
            let entry = join_part("xl", target);
            let xml = read_entry(&mut archive, &entry)?;
            let mut sheet = parse_sheet(&xml, &shared)?;
            sheet.name = name;
            sheet.images = read_sheet_images(&mut archive, &entry)?;
            sheets.push(sheet);
        }

        Ok(Self { sheets })
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, WorkbookError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| WorkbookError::Archive(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| WorkbookError::Io(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(WorkbookError::Archive(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn entry_exists(archive: &mut Archive<'_>, name: &str) -> bool {
    archive.by_name(name).is_ok()
}

/// Resolve a rels target ("worksheets/sheet1.xml", "../media/image1.png")
/// against the directory of the part that referenced it.
fn join_part(base_dir: &str, target: &str) -> String {
    let mut parts: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for seg in target.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// `xl/sharedStrings.xml` → string table. Absent entry means the workbook
/// only uses inline strings.
fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, WorkbookError> {
    if !entry_exists(archive, "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let xml = read_entry(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(WorkbookError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// `xl/workbook.xml` → ordered (sheet name, relationship id) pairs.
fn read_sheet_index(archive: &mut Archive<'_>) -> Result<Vec<(String, String)>, WorkbookError> {
    let xml = read_entry(archive, "xl/workbook.xml")?;
    let mut out = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"sheet" {
                    let mut name = None;
                    let mut rid = None;
                    for attr in e.attributes().flatten() {
                        let value = attr.unescape_value().unwrap_or_default().into_owned();
                        match attr.key.as_ref() {
                            b"name" => name = Some(value),
                            // The id attribute is namespaced (`r:id`).
                            key if key == b"r:id" || attr.key.local_name().as_ref() == b"id" => {
                                rid = Some(value)
                            }
                            _ => {}
                        }
                    }
                    if let (Some(name), Some(rid)) = (name, rid) {
                        out.push((name, rid));
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(WorkbookError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// A `.rels` part → relationship id → target map.
fn read_rels(
    archive: &mut Archive<'_>,
    entry: &str,
) -> Result<HashMap<String, String>, WorkbookError> {
    let mut out = HashMap::new();
    if !entry_exists(archive, entry) {
        return Ok(out);
    }
    let xml = read_entry(archive, entry)?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Relationship" {
                    let mut id = None;
                    let mut target = None;
                    for attr in e.attributes().flatten() {
                        let value = attr.unescape_value().unwrap_or_default().into_owned();
                        match attr.key.as_ref() {
                            b"Id" => id = Some(value),
                            b"Target" => target = Some(value),
                            _ => {}
                        }
                    }
                    if let (Some(id), Some(target)) = (id, target) {
                        out.insert(id, target);
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(WorkbookError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Parse "B3" → (row 2, col 1), both 0-based.
fn parse_cell_ref(r: &str) -> Option<(usize, usize)> {
    let letters: String = r.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits: &str = &r[letters.len()..];
    if letters.is_empty() || digits.is_empty() {
        return None;
    }
    let mut col = 0usize;
    for c in letters.chars() {
        col = col * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((row - 1, col - 1))
}

/// Appends so that rich-text runs split across several `<t>` elements in
/// one cell concatenate instead of clobbering each other.
fn append_cell(rows: &mut Vec<Vec<String>>, row: usize, col: usize, value: &str) {
    if rows.len() <= row {
        rows.resize_with(row + 1, Vec::new);
    }
    let r = &mut rows[row];
    if r.len() <= col {
        r.resize_with(col + 1, String::new);
    }
    r[col].push_str(value);
}

/// One worksheet XML part → cell grid.
fn parse_sheet(xml: &[u8], shared: &[String]) -> Result<Sheet, WorkbookError> {
    #[derive(Clone, Copy, PartialEq)]
    enum CellType {
        SharedString,
        InlineString,
        Other,
    }

    let mut sheet = Sheet::default();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut cur_row = 0usize;
    let mut next_col = 0usize;
    let mut cell_pos: Option<(usize, usize)> = None;
    let mut cell_type = CellType::Other;
    let mut in_v = false;
    let mut in_is_t = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                match e.local_name().as_ref() {
                    b"row" => {
                        let explicit = e.attributes().flatten().find_map(|a| {
                            (a.key.as_ref() == b"r")
                                .then(|| a.unescape_value().ok()?.parse::<usize>().ok())
                                .flatten()
                        });
                        cur_row = match explicit {
                            Some(r) if r > 0 => r - 1,
                            _ => cur_row,
                        };
                        next_col = 0;
                    }
                    b"c" => {
                        let mut pos = None;
                        cell_type = CellType::Other;
                        for attr in e.attributes().flatten() {
                            let value = attr.unescape_value().unwrap_or_default();
                            match attr.key.as_ref() {
                                b"r" => pos = parse_cell_ref(&value),
                                b"t" => {
                                    cell_type = match value.as_ref() {
                                        "s" => CellType::SharedString,
                                        "inlineStr" => CellType::InlineString,
                                        _ => CellType::Other,
                                    }
                                }
                                _ => {}
                            }
                        }
                        let pos = pos.unwrap_or((cur_row, next_col));
                        next_col = pos.1 + 1;
                        cell_pos = Some(pos);
                    }
                    b"v" => in_v = true,
                    b"t" if cell_type == CellType::InlineString => in_is_t = true,
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_v || in_is_t => {
                if let Some((row, col)) = cell_pos {
                    let raw = te.unescape().unwrap_or_default();
                    let text = if in_v && cell_type == CellType::SharedString {
                        raw.trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default()
                    } else {
                        raw.into_owned()
                    };
                    if !text.is_empty() {
                        append_cell(&mut sheet.rows, row, col, &text);
                        cell_count += 1;
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"t" => in_is_t = false,
                b"c" => {
                    cell_pos = None;
                    cell_type = CellType::Other;
                }
                b"row" => cur_row += 1,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(WorkbookError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(sheet)
}

/// Resolve the drawing part attached to a worksheet and map every anchored
/// picture to the (row, col) of its top-left anchor cell.
fn read_sheet_images(
    archive: &mut Archive<'_>,
    sheet_entry: &str,
) -> Result<HashMap<(usize, usize), Vec<u8>>, WorkbookError> {
    let mut images = HashMap::new();

    let (dir, file) = match sheet_entry.rsplit_once('/') {
        Some(split) => split,
        None => return Ok(images),
    };
    let sheet_rels_entry = format!("{}/_rels/{}.rels", dir, file);
    let sheet_rels = read_rels(archive, &sheet_rels_entry)?;

    // A worksheet references at most one drawing part.
    let drawing_target = sheet_rels
        .values()
        .find(|t| t.contains("drawings/"))
        .cloned();
    let Some(target) = drawing_target else {
        return Ok(images);
    };
    let drawing_entry = join_part(dir, &target);
    if !entry_exists(archive, &drawing_entry) {
        return Ok(images);
    }

    let anchors = parse_drawing_anchors(&read_entry(archive, &drawing_entry)?)?;
    if anchors.is_empty() {
        return Ok(images);
    }

    let (drawing_dir, drawing_file) = drawing_entry.rsplit_once('/').unwrap_or(("", ""));
    let drawing_rels_entry = format!("{}/_rels/{}.rels", drawing_dir, drawing_file);
    let drawing_rels = read_rels(archive, &drawing_rels_entry)?;

    for ((row, col), rid) in anchors {
        let Some(media_target) = drawing_rels.get(&rid) else {
            continue;
        };
        let media_entry = join_part(drawing_dir, media_target);
        if entry_exists(archive, &media_entry) {
            images.insert((row, col), read_entry(archive, &media_entry)?);
        }
    }
    Ok(images)
}

/// Drawing XML → (anchor row, anchor col) → image relationship id.
fn parse_drawing_anchors(
    xml: &[u8],
) -> Result<HashMap<(usize, usize), String>, WorkbookError> {
    let mut anchors = HashMap::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut in_from = false;
    let mut capture: Option<&'static str> = None;
    let mut from_col: Option<usize> = None;
    let mut from_row: Option<usize> = None;
    let mut embed: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                match e.local_name().as_ref() {
                    b"from" => in_from = true,
                    b"col" if in_from => capture = Some("col"),
                    b"row" if in_from => capture = Some("row"),
                    b"blip" => {
                        embed = e.attributes().flatten().find_map(|a| {
                            (a.key.local_name().as_ref() == b"embed")
                                .then(|| a.unescape_value().ok().map(|v| v.into_owned()))
                                .flatten()
                        });
                    }
                    _ => {}
                }
            }
            Ok(quick_xml::events::Event::Text(te)) => {
                if let Some(which) = capture {
                    let value = te.unescape().unwrap_or_default().trim().parse::<usize>().ok();
                    match which {
                        "col" => from_col = value,
                        _ => from_row = value,
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"from" => in_from = false,
                b"col" | b"row" => capture = None,
                name if name.ends_with(b"Anchor") => {
                    if let (Some(col), Some(row), Some(rid)) = (from_col, from_row, embed.take()) {
                        anchors.insert((row, col), rid);
                    }
                    from_col = None;
                    from_row = None;
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(WorkbookError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(anchors)
}
