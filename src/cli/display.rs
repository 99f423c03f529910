//! Output and display functions for CLI results

use colored::Colorize;

use kbsearch::health::HealthReport;
use kbsearch::pool::{PoolStats, RoleStats};
use kbsearch::{CacheStats, SearchResponse, StoreStats, Suggestion};

/// Longest problem excerpt shown under a result
const EXCERPT_CHARS: usize = 120;

fn excerpt(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= EXCERPT_CHARS {
        line.to_string()
    } else {
        let cut: String = line.chars().take(EXCERPT_CHARS).collect();
        format!("{cut}...")
    }
}

/// Display ranked search results
pub fn display_search(response: &SearchResponse) {
    if response.results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, result) in response.results.iter().enumerate() {
        let entry = &result.entry;
        println!(
            "{:>2}. {} {}",
            i + 1,
            entry.title.bold(),
            format!("[{:.1}]", result.score).dimmed()
        );
        let mut meta = format!("    {} | {}", entry.category.cyan(), result.strategy);
        if result.strategy_count > 1 {
            meta.push_str(&format!(" x{}", result.strategy_count));
        }
        if !entry.tags.is_empty() {
            meta.push_str(&format!(" | {}", entry.tags.join(", ")));
        }
        println!("{meta}");
        println!("    {}", excerpt(&entry.problem));
        println!("    {}", entry.id.dimmed());
    }
    let source = match response.lookup {
        Some(lookup) if response.from_cache() => format!("cache ({lookup:?})").to_lowercase(),
        _ => "store".to_string(),
    };
    println!(
        "{}",
        format!(
            "{} results via {} from {} in {}ms",
            response.results.len(),
            response.strategy.map_or("none".to_string(), |s| s.to_string()),
            source,
            response.elapsed_ms
        )
        .dimmed()
    );
}

pub fn display_suggestions(suggestions: &[Suggestion]) {
    if suggestions.is_empty() {
        println!("No suggestions.");
        return;
    }
    for s in suggestions {
        let kind = format!("{:?}", s.kind).to_lowercase();
        println!("{:<10} {} {}", kind.dimmed(), s.text, format!("({})", s.usage).dimmed());
    }
}

fn role_line(name: &str, stats: &RoleStats) -> String {
    format!(
        "  {name:<8} open {}/{}  idle {}  in use {}  waiting {}  timeouts {}",
        stats.open, stats.max, stats.idle, stats.in_use, stats.waiting, stats.timeouts
    )
}

pub fn display_stats(store: &StoreStats, pool: &PoolStats, cache: &CacheStats) {
    println!("{}", "Store".bold());
    println!("  entries   {} ({} archived)", store.total_entries, store.archived_entries);
    println!("  categories {}", store.categories);
    println!("  tags       {}", store.distinct_tags);
    println!("{}", "Pool".bold());
    println!("{}", role_line("readers", &pool.readers));
    println!("{}", role_line("writers", &pool.writers));
    println!("  wal {}", pool.wal_enabled);
    println!("{}", "Cache".bold());
    println!(
        "  entries {}  memory {}/{} bytes  hit rate {:.1}%",
        cache.entries,
        cache.memory_bytes,
        cache.max_memory_bytes,
        cache.hit_rate * 100.0
    );
    println!(
        "  hits {}  misses {}  joined {}  evictions {}  expirations {}",
        cache.hits, cache.misses, cache.joined, cache.evictions, cache.expirations
    );
}

pub fn display_health(report: &HealthReport) {
    let status = if report.healthy {
        "healthy".green().bold()
    } else {
        "UNHEALTHY".red().bold()
    };
    println!("Status: {status}");
    println!(
        "  pool latency {}ms, blocked {}, connect errors {}",
        report.pool.latency_ms, report.pool.blocked_waiters, report.pool.connect_errors
    );
    println!(
        "  store integrity {}, schema v{}",
        if report.store.integrity_ok { "ok" } else { "FAILED" },
        report
            .store
            .schema_version
            .map_or("?".to_string(), |v| v.to_string())
    );
    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
}
