use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use famicore::config::EmulatorConfig;
use famicore::nes::{Nes, TvSystem};
use quick_xml::Reader;
use quick_xml::events::Event;
use sha1::{Digest, Sha1};
use tracing_subscriber::EnvFilter;

/// One `<test>` entry of the suite XML.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SuiteTest {
    filename: String,
    system: String,
    runframes: u32,
    tvsha1: String,
    recordedinput: String,
}

#[derive(Debug, Clone)]
struct Options {
    suite: PathBuf,
    rom_root: PathBuf,
    max_tests: usize,
    include_pal: bool,
    contains: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            suite: PathBuf::from("external/nes-test-roms/test_roms.xml"),
            rom_root: PathBuf::from("external/nes-test-roms"),
            max_tests: usize::MAX,
            include_pal: false,
            contains: Vec::new(),
        }
    }
}

/// Byte orders tried when comparing against recorded digests.
#[derive(Debug, Clone, Copy)]
enum PixelLayout {
    Rgba,
    Rgb,
    Bgra,
}

impl PixelLayout {
    const ALL: [Self; 3] = [Self::Rgba, Self::Rgb, Self::Bgra];

    fn encode(self, frame_rgba: &[u8]) -> Vec<u8> {
        match self {
            Self::Rgba => frame_rgba.to_vec(),
            Self::Rgb => frame_rgba
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            Self::Bgra => frame_rgba
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0], px[3]])
                .collect(),
        }
    }
}

fn parse_args() -> Result<Options> {
    let mut opts = Options::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--suite" => opts.suite = PathBuf::from(args.next().context("--suite requires a path")?),
            "--rom-root" => {
                opts.rom_root = PathBuf::from(args.next().context("--rom-root requires a path")?)
            }
            "--max-tests" => {
                let value = args.next().context("--max-tests requires an integer")?;
                opts.max_tests = value
                    .parse()
                    .with_context(|| format!("invalid --max-tests value: {value}"))?;
            }
            "--include-pal" => opts.include_pal = true,
            "--contains" => {
                let value = args.next().context("--contains requires a substring")?;
                opts.contains.push(value.to_lowercase());
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}\nUse --help to view supported options."),
        }
    }

    Ok(opts)
}

fn print_help() {
    println!(
        "Frame-hash ROM suite runner\n\n\
Usage:\n\
  rom_test_runner [options]\n\n\
Options:\n\
  --suite <path>       Path to the suite XML\n\
  --rom-root <path>    Directory the test filenames are relative to\n\
  --max-tests <n>      Stop after n selected tests\n\
  --include-pal        Also run PAL tests\n\
  --contains <text>    Only run tests whose filename contains text (repeatable)\n\
  -h, --help           Show this help\n"
    );
}

fn parse_suite(xml: &str) -> Result<Vec<SuiteTest>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut tests = Vec::new();
    let mut current: Option<SuiteTest> = None;
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"test" => {
                    let mut test = SuiteTest {
                        filename: String::new(),
                        system: String::new(),
                        runframes: 0,
                        tvsha1: String::new(),
                        recordedinput: String::new(),
                    };
                    for attr in e.attributes().flatten() {
                        let value = attr
                            .decode_and_unescape_value(reader.decoder())
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        match attr.key.as_ref() {
                            b"filename" => test.filename = value,
                            b"system" => test.system = value,
                            b"runframes" => {
                                test.runframes = value
                                    .parse()
                                    .with_context(|| format!("bad runframes: {value}"))?
                            }
                            _ => {}
                        }
                    }
                    current = Some(test);
                }
                b"tvsha1" => field = Some("tvsha1"),
                b"recordedinput" => field = Some("recordedinput"),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.decode().map(|v| v.to_string()).unwrap_or_default();
                append_field(current.as_mut(), field, &text);
            }
            Ok(Event::CData(e)) => {
                let text = e.decode().map(|v| v.to_string()).unwrap_or_default();
                append_field(current.as_mut(), field, &text);
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"tvsha1" | b"recordedinput" => field = None,
                b"test" => {
                    if let Some(mut test) = current.take() {
                        test.tvsha1 = test.tvsha1.trim().to_string();
                        test.recordedinput = test.recordedinput.trim().to_string();
                        tests.push(test);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => bail!("failed to parse suite XML: {err}"),
            _ => {}
        }
    }

    Ok(tests)
}

fn append_field(test: Option<&mut SuiteTest>, field: Option<&str>, text: &str) {
    match (test, field) {
        (Some(test), Some("tvsha1")) => test.tvsha1.push_str(text),
        (Some(test), Some("recordedinput")) => test.recordedinput.push_str(text),
        _ => {}
    }
}

fn should_run(test: &SuiteTest, opts: &Options) -> bool {
    if !opts.include_pal && test.system.eq_ignore_ascii_case("pal") {
        return false;
    }
    if opts.contains.is_empty() {
        return true;
    }
    let lower = test.filename.to_lowercase();
    opts.contains.iter().any(|f| lower.contains(f))
}

/// Recorded input is one controller-1 byte per frame, base64 encoded.
fn decode_recorded_input(encoded: &str) -> Result<Vec<u8>> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(encoded)
        .context("recorded input is not valid base64")
}

fn frame_digests(frame_rgba: &[u8]) -> Vec<(PixelLayout, String)> {
    PixelLayout::ALL
        .iter()
        .map(|&layout| {
            let digest = Sha1::digest(layout.encode(frame_rgba));
            (layout, BASE64_STANDARD.encode(digest))
        })
        .collect()
}

enum Outcome {
    Pass(PixelLayout),
    Fail { got: String, pc: u16 },
}

fn run_single(test: &SuiteTest, opts: &Options) -> Result<Outcome> {
    let rom_path = opts.rom_root.join(&test.filename);
    let config = EmulatorConfig {
        tv_system: Some(if test.system.eq_ignore_ascii_case("pal") {
            TvSystem::Pal
        } else {
            TvSystem::Ntsc
        }),
        ..EmulatorConfig::default()
    };
    let mut nes = Nes::from_path(&rom_path, &config)?;
    let input = decode_recorded_input(&test.recordedinput)?;

    for frame in 0..test.runframes as usize {
        nes.set_controller_state(input.get(frame).copied().unwrap_or(0));
        nes.run_frame()?;
    }

    let digests = frame_digests(nes.frame_buffer());
    if let Some((layout, _)) = digests.iter().find(|(_, d)| *d == test.tvsha1) {
        return Ok(Outcome::Pass(*layout));
    }
    Ok(Outcome::Fail {
        got: digests[0].1.clone(),
        pc: nes.cpu().pc,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let opts = parse_args()?;
    let start = Instant::now();
    let xml = fs::read_to_string(&opts.suite)
        .with_context(|| format!("failed to read suite XML: {}", opts.suite.display()))?;
    let selected: Vec<SuiteTest> = parse_suite(&xml)?
        .into_iter()
        .filter(|t| should_run(t, &opts))
        .take(opts.max_tests)
        .collect();

    println!(
        "Running {} test(s) from {}",
        selected.len(),
        opts.suite.display()
    );

    let (mut passed, mut failed, mut skipped) = (0usize, 0usize, 0usize);
    for (idx, test) in selected.iter().enumerate() {
        let label = format!("[{}/{}] {}", idx + 1, selected.len(), test.filename);
        match run_single(test, &opts) {
            Ok(Outcome::Pass(layout)) => {
                passed += 1;
                println!("PASS {label} [{layout:?}]");
            }
            Ok(Outcome::Fail { got, pc }) => {
                failed += 1;
                println!("FAIL {label}\n  expected: {}\n  got:      {got}\n  pc=${pc:04X}", test.tvsha1);
            }
            Err(err) => {
                skipped += 1;
                println!("SKIP {label} -> {err:#}");
            }
        }
    }

    println!();
    println!("Summary:");
    println!("- Passed: {passed}");
    println!("- Failed: {failed}");
    println!("- Skipped: {skipped}");
    println!("- Runtime: {:.2}s", start.elapsed().as_secs_f32());

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
