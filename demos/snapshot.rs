use heapscope::{
    DumpMode, DumpRequest, Endian, GlobalSymbol, Inspector, LeakRequest, LiveOwners, NodeHeader,
    PointerWidth, ProcessSymbols, Region, Snapshot, TargetConfig, Tracking, encode_heap_header,
    encode_word,
};
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;

const HEAP: u64 = 0x2000_0000;
const DATA: u64 = 0x1000_0000;
const WIDTH: PointerWidth = PointerWidth::Eight;
const ENDIAN: Endian = Endian::Little;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_log()?;

    let (target, memory, globals) = build_image()?;
    let symbols = ProcessSymbols::new(globals);
    let owners: LiveOwners = [1].into_iter().collect();
    let inspector = Inspector::new(&target, &memory, &symbols, &owners)?;

    let dump = inspector.dump(&DumpRequest::default());
    tracing::info!(
        "{} allocated units, {} bytes",
        dump.totals.count,
        dump.totals.bytes
    );
    for row in &dump.rows {
        let site = row
            .callstack
            .first()
            .and_then(|frame| frame.location.as_ref())
            .map(|location| location.function.as_str())
            .unwrap_or("<none>");
        tracing::info!(
            "{:#x} owner {:?} x{} {} bytes alive={} at {site}",
            row.unit.address(),
            row.unit.owner(),
            row.count,
            row.bytes,
            row.alive
        );
    }

    let orphans = inspector.dump(&DumpRequest::new(DumpMode::Orphans).with_detail(true));
    tracing::info!("{} orphan nodes", orphans.rows.len());

    let fragmentation = inspector.fragmentation();
    tracing::info!(
        "fragmentation {:.1}/1000, {} free bytes in {} nodes, largest {}",
        fragmentation.rate,
        fragmentation.free_size,
        fragmentation.free_blocks,
        fragmentation.largest
    );

    let leaks = inspector.leaks(&LeakRequest::default());
    for row in &leaks.rows {
        tracing::warn!(
            "leaked {:#x}: {} bytes in {} units",
            row.unit.address(),
            row.bytes,
            row.count
        );
    }
    tracing::info!(
        "{} reachable, {} leaked units ({} bytes) in {:?}",
        leaks.reachable,
        leaks.totals.count,
        leaks.totals.bytes,
        leaks.elapsed
    );

    Ok(())
}

/// Lays out a small heap: two live nodes, a free gap, and one node nobody points to.
fn build_image() -> Result<(TargetConfig, Snapshot, Vec<GlobalSymbol>), Box<dyn std::error::Error>>
{
    let target = TargetConfig::new(WIDTH).with_tracking(Tracking::Backtrace(4));
    let layout = target.node_layout();
    let site = build_image as usize as u64;

    let mut memory = Snapshot::new();
    memory.add_zeroed(HEAP, 0x400);

    let mut cursor = HEAP;
    let mut prev_free = false;
    let mut payloads = Vec::new();
    for (sequence, (size, owner, allocated)) in
        [(0x80, 1, true), (0xc0, 2, true), (0x40, 0, false), (0x80, 1, true)]
            .into_iter()
            .enumerate()
    {
        let header = encode_heap_header(NodeHeader {
            size,
            allocated,
            prev_free,
        });
        memory.write_word(cursor + layout.size, header, WIDTH, ENDIAN)?;
        if allocated {
            memory.write_u32(cursor + layout.owner, owner as u32, ENDIAN)?;
            memory.write_word(cursor + layout.sequence, sequence as u64, WIDTH, ENDIAN)?;
            memory.write_word(cursor + layout.backtrace, site, WIDTH, ENDIAN)?;
        }
        payloads.push(cursor + layout.header_size);
        prev_free = !allocated;
        cursor += size;
    }

    // global -> first node -> second node
    memory.write_word(payloads[0], payloads[1], WIDTH, ENDIAN)?;
    memory.add_segment(DATA, encode_word(payloads[0], WIDTH, ENDIAN));
    let globals = vec![GlobalSymbol {
        name: "g_registry".to_string(),
        address: DATA,
        size: WIDTH.bytes(),
    }];

    Ok((
        target.with_region(Region::new(HEAP, cursor)),
        memory,
        globals,
    ))
}

fn init_log() -> Result<(), Box<dyn std::error::Error>> {
    let stdout_logger = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_line_number(true)
        .with_writer(std::io::stdout);

    let registry = tracing_subscriber::registry()
        .with(stdout_logger.with_filter(LevelFilter::from(Level::DEBUG)));

    tracing::subscriber::set_global_default(registry)?;

    Ok(())
}
