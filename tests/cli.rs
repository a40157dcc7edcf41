use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn triage_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("triage");
    path
}

/// Build a minimal XLSX workbook (inline strings) with one named sheet.
fn build_workbook(sheet_name: &str, rows: &[&[&str]]) -> Vec<u8> {
    let workbook_xml = format!(
        r#"<?xml version="1.0"?><workbook xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        sheet_name
    );
    let rels_xml = r#"<?xml version="1.0"?><Relationships><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

    let mut sheet_xml = String::from(r#"<?xml version="1.0"?><worksheet><sheetData>"#);
    for (row_idx, row) in rows.iter().enumerate() {
        sheet_xml.push_str(&format!(r#"<row r="{}">"#, row_idx + 1));
        for (col_idx, cell) in row.iter().enumerate() {
            if cell.is_empty() {
                continue;
            }
            let col_letter = (b'A' + col_idx as u8) as char;
            let escaped = cell
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            sheet_xml.push_str(&format!(
                r#"<c r="{}{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                col_letter,
                row_idx + 1,
                escaped
            ));
        }
        sheet_xml.push_str("</row>");
    }
    sheet_xml.push_str("</sheetData></worksheet>");

    let mut buf = Vec::new();
    {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in [
            ("xl/workbook.xml", workbook_xml.as_str()),
            ("xl/_rels/workbook.xml.rels", rels_xml),
            ("xl/worksheets/sheet1.xml", sheet_xml.as_str()),
        ] {
            writer.start_file(name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    buf
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let workbook = build_workbook(
        "en",
        &[
            &["", "iPhone X", "iPhone 8"],
            &["Code", "iPhone10,1", "iPhone10,4"],
            &["\"wdog\"", "Check PMIC rail;http://kb.example/wdog", ""],
            &["\"wdog\" mini", "Quick check: reflow PMIC", ""],
            &["\"SoC\\/panic\"", "", "Inspect SoC power rail"],
        ],
    );
    fs::write(data_dir.join("panic_codes.xlsx"), workbook).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/triage.sqlite"

[kb]
workbook = "{root}/data/panic_codes.xlsx"
language = "en"

[limiter]
max_attempts = 2
cooldown_hours = 3
"#,
        root = root.display()
    );

    let config_path = config_dir.join("triage.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_triage(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = triage_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run triage binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_triage(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_triage(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_triage(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_codes_list_includes_unescaped_variants() {
    let (_tmp, config_path) = setup_test_env();
    run_triage(&config_path, &["init"]);

    let (stdout, stderr, success) = run_triage(&config_path, &["codes", "list"]);
    assert!(success, "codes list failed: {}", stderr);
    assert!(stdout.contains("\"wdog\""));
    assert!(stdout.contains("\"wdog\" mini"));
    assert!(stdout.contains("\"SoC\\/panic\""));
    assert!(stdout.contains("\"SoC/panic\""));
    assert!(stdout.contains("known codes"));
}

#[test]
fn test_codes_reload() {
    let (_tmp, config_path) = setup_test_env();
    run_triage(&config_path, &["init"]);

    let (stdout, _, success) = run_triage(&config_path, &["codes", "reload"]);
    assert!(success);
    assert!(stdout.contains("reloaded"));
}

#[test]
fn test_lookup_tiering_mini_over_full() {
    let (_tmp, config_path) = setup_test_env();
    run_triage(&config_path, &["init"]);

    let (stdout, stderr, success) = run_triage(
        &config_path,
        &["lookup", "\"wdog\"", "--product", "iPhone10,1"],
    );
    assert!(success, "lookup failed: {}", stderr);
    assert!(stdout.contains("solution (mini)"));
    assert!(stdout.contains("Quick check: reflow PMIC"));
    assert!(stdout.contains("full solution available"));
    assert!(!stdout.contains("Check PMIC rail"));
}

#[test]
fn test_lookup_fallback_column() {
    let (_tmp, config_path) = setup_test_env();
    run_triage(&config_path, &["init"]);

    // iPhone10,1 has no content for SoC/panic; the other column supplies it.
    let (stdout, _, success) = run_triage(
        &config_path,
        &["lookup", "SoC/panic", "--product", "iPhone10,1"],
    );
    assert!(success);
    assert!(stdout.contains("solution (full)"));
    assert!(stdout.contains("Inspect SoC power rail"));
}

#[test]
fn test_model_resolves_display_name() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_triage(&config_path, &["model", "iPhone10,1"]);
    assert!(success);
    assert!(stdout.contains("iPhone X"));

    let (stdout, _, success) = run_triage(&config_path, &["model", "iPad1,1"]);
    assert!(success);
    assert!(stdout.contains("iPad1,1"));
}

#[test]
fn test_analyze_text_dump_with_embedded_code() {
    let (tmp, config_path) = setup_test_env();
    run_triage(&config_path, &["init"]);

    let dump = tmp.path().join("panic.txt");
    fs::write(
        &dump,
        r#"{"product":"iPhone10,1","panicString":"wdog slide 0x1234","crashReporterKey":"KEY77"}"#,
    )
    .unwrap();

    let (stdout, stderr, success) = run_triage(
        &config_path,
        &["analyze", dump.to_str().unwrap(), "--user", "7"],
    );
    assert!(success, "analyze failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("device: iPhone X"));
    assert!(stdout.contains("error code: \"wdog\""));
    assert!(stdout.contains("solution (mini)"));
    assert!(stdout.contains("solution found: yes"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_analyze_structured_log() {
    let (tmp, config_path) = setup_test_env();
    run_triage(&config_path, &["init"]);

    let log = tmp.path().join("crash.ips");
    fs::write(
        &log,
        "{\"bug_type\":\"210\"}\n{\"product\":\"iPhone10,4\",\"build\":\"16.1\",\"panicString\":\"SoC/panic slide 0xdead\"}",
    )
    .unwrap();

    let (stdout, _, success) = run_triage(
        &config_path,
        &["analyze", log.to_str().unwrap(), "--user", "7"],
    );
    assert!(success);
    assert!(stdout.contains("device: iPhone 8"));
    assert!(stdout.contains("os version: 16.1"));
    assert!(stdout.contains("solution found: yes"));
}

#[test]
fn test_analyze_repeat_failures_hit_the_limiter() {
    let (tmp, config_path) = setup_test_env();
    run_triage(&config_path, &["init"]);

    let dump = tmp.path().join("mystery.txt");
    fs::write(
        &dump,
        r#"{"product":"iPhone10,1","panicString":"nothing anyone recognizes"}"#,
    )
    .unwrap();

    for round in 1..=2 {
        let (stdout, stderr, success) = run_triage(
            &config_path,
            &["analyze", dump.to_str().unwrap(), "--user", "7"],
        );
        assert!(success, "round {} failed: {}", round, stderr);
        assert!(stdout.contains("solution found: no"), "round {}: {}", round, stdout);
    }

    let (stdout, _, success) = run_triage(
        &config_path,
        &["analyze", dump.to_str().unwrap(), "--user", "7"],
    );
    assert!(success);
    assert!(stdout.contains("rejected"), "expected rejection: {}", stdout);
    assert!(stdout.contains("Try again in"));

    // A different user analyzes the same file freely.
    let (stdout, _, _) = run_triage(
        &config_path,
        &["analyze", dump.to_str().unwrap(), "--user", "8"],
    );
    assert!(stdout.contains("solution found: no"));
}

#[test]
fn test_analyze_rejects_unknown_extension() {
    let (tmp, config_path) = setup_test_env();
    run_triage(&config_path, &["init"]);

    let file = tmp.path().join("report.pdf");
    fs::write(&file, b"%PDF-").unwrap();

    let (_, stderr, success) = run_triage(
        &config_path,
        &["analyze", file.to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("readable kinds"), "stderr: {}", stderr);
}

#[test]
fn test_history_after_analyses() {
    let (tmp, config_path) = setup_test_env();
    run_triage(&config_path, &["init"]);

    let dump = tmp.path().join("panic.txt");
    fs::write(
        &dump,
        r#"{"product":"iPhone10,1","panicString":"wdog slide 0x1"}"#,
    )
    .unwrap();
    run_triage(
        &config_path,
        &["analyze", dump.to_str().unwrap(), "--user", "7"],
    );

    let (stdout, _, success) = run_triage(&config_path, &["history", "--user", "7"]);
    assert!(success);
    assert!(stdout.contains("text_dump"));
    assert!(stdout.contains("solved"));
    assert!(stdout.contains("1 records"));

    let (stdout, _, _) = run_triage(&config_path, &["history", "--user", "9"]);
    assert!(stdout.contains("No analyses recorded."));
}

#[test]
fn test_missing_workbook_degrades() {
    let (tmp, config_path) = setup_test_env();
    fs::remove_file(tmp.path().join("data/panic_codes.xlsx")).unwrap();
    run_triage(&config_path, &["init"]);

    let (stdout, _, success) = run_triage(&config_path, &["lookup", "\"wdog\""]);
    assert!(success);
    assert!(stdout.contains("No Knowledge Base available."));

    let dump = tmp.path().join("panic.txt");
    fs::write(&dump, r#"{"panicString":"wdog slide"}"#).unwrap();
    let (stdout, _, success) = run_triage(
        &config_path,
        &["analyze", dump.to_str().unwrap()],
    );
    assert!(success, "analyze should degrade, not fail");
    assert!(stdout.contains("solution found: no"));
}
