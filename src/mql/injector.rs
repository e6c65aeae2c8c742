use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

/// Suffix appended to the modified working copy of the EA.
pub const MODIFIED_SUFFIX: &str = "_stress_test";

/// Custom optimization criterion injected when the EA has no `OnTester`.
///
/// Score: profit × R² × sqrt(trades/100) × 1/(1 + dd/50), with sentinels for
/// too-few trades (−1000) and non-positive profit (−500), and a small bonus
/// above a 1.5 profit factor. `{MIN_TRADES}` is substituted at injection time.
const ONTESTER_TEMPLATE: &str = r#"
//+------------------------------------------------------------------+
//| OnTester - injected criterion                                    |
//| Score: Profit x R^2 x sqrt(trades/100) x DD factor               |
//+------------------------------------------------------------------+
double OnTester()
{
    double profit = TesterStatistics(STAT_PROFIT);
    double trades = TesterStatistics(STAT_TRADES);
    double maxDD = TesterStatistics(STAT_EQUITY_DDREL_PERCENT);
    double profitFactor = TesterStatistics(STAT_PROFIT_FACTOR);

    if(trades < {MIN_TRADES}) return -1000;
    if(profit <= 0) return -500;

    // Soft drawdown penalty: 0% DD = 1.0, 25% = 0.67, 50% = 0.5
    double ddFactor = 1.0 / (1.0 + maxDD / 50.0);

    if(!HistorySelect(0, TimeCurrent()))
        return profit * ddFactor * MathSqrt(trades / 100.0);

    int totalDeals = HistoryDealsTotal();
    if(totalDeals < 10)
        return profit * ddFactor * MathSqrt(trades / 100.0);

    // Equity curve from closed deals for the R^2 term
    double equity[];
    ArrayResize(equity, 0);
    double cumProfit = 0;

    for(int i = 0; i < totalDeals; i++)
    {
        ulong ticket = HistoryDealGetTicket(i);
        if(ticket == 0) continue;

        long dealType = HistoryDealGetInteger(ticket, DEAL_TYPE);
        if(dealType == DEAL_TYPE_BUY || dealType == DEAL_TYPE_SELL)
        {
            double dealProfit = HistoryDealGetDouble(ticket, DEAL_PROFIT);
            double dealSwap = HistoryDealGetDouble(ticket, DEAL_SWAP);
            double dealComm = HistoryDealGetDouble(ticket, DEAL_COMMISSION);
            cumProfit += dealProfit + dealSwap + dealComm;

            int size = ArraySize(equity);
            ArrayResize(equity, size + 1);
            equity[size] = cumProfit;
        }
    }

    int n = ArraySize(equity);
    if(n < 10)
        return profit * ddFactor * MathSqrt(trades / 100.0);

    double sumX = 0, sumY = 0, sumXY = 0, sumX2 = 0;
    for(int i = 0; i < n; i++)
    {
        double x = (double)i;
        double y = equity[i];
        sumX += x;
        sumY += y;
        sumXY += x * y;
        sumX2 += x * x;
    }

    double nD = (double)n;
    double denom = nD * sumX2 - sumX * sumX;
    if(MathAbs(denom) < 1e-10)
        return profit * ddFactor * MathSqrt(trades / 100.0);

    double slope = (nD * sumXY - sumX * sumY) / denom;
    double intercept = (sumY - slope * sumX) / nD;
    double meanY = sumY / nD;

    double ssTotal = 0, ssResidual = 0;
    for(int i = 0; i < n; i++)
    {
        double y = equity[i];
        double yPred = slope * (double)i + intercept;
        ssTotal += (y - meanY) * (y - meanY);
        ssResidual += (y - yPred) * (y - yPred);
    }

    double rSquared = 1.0;
    if(ssTotal > 1e-10)
        rSquared = 1.0 - (ssResidual / ssTotal);
    if(rSquared < 0) rSquared = 0;
    if(rSquared > 1) rSquared = 1;

    double score = profit * rSquared * MathSqrt(trades / 100.0) * ddFactor;

    if(profitFactor > 1.5)
        score *= (1.0 + (profitFactor - 1.5) * 0.03);

    return score;
}
"#;

/// Guard block neutralizing side-effectful calls while under test.
const SAFETY_GUARDS: &str = r#"
//+------------------------------------------------------------------+
//| Safety Guards - injected                                         |
//+------------------------------------------------------------------+
#define STRESS_TEST_MODE true

#ifdef STRESS_TEST_MODE
    // Prevent file operations
    #define FileOpen(a,b,c) INVALID_HANDLE
    #define FileWrite(a,b) 0
    #define FileDelete(a) false

    // Prevent web requests
    #define WebRequest(a,b,c,d,e,f,g) false

    // Prevent DLL calls
    #define DLLCall(a,b) 0
#endif
"#;

/// Spread/slippage limits enforced around every order send. The inputs carry
/// the reserved prefix so the extractor never marks them optimizable.
const TRADE_SAFETY_GUARDS: &str = r#"
//+------------------------------------------------------------------+
//| Trade Safety - injected                                          |
//+------------------------------------------------------------------+
#ifdef STRESS_TEST_MODE

input double EAStressSafety_MaxSpreadPips = 3.0;     // Max allowed spread (pips)
input double EAStressSafety_MaxSlippagePips = 3.0;   // Max allowed slippage (pips)

double EAStressSafety_PipSize()
{
    if(_Digits == 3 || _Digits == 5) return _Point * 10.0;
    return _Point;
}

bool EAStressSafety_IsSpreadOk()
{
    if(EAStressSafety_MaxSpreadPips <= 0) return true;

    long spreadPoints = 0;
    if(!SymbolInfoInteger(_Symbol, SYMBOL_SPREAD, spreadPoints)) return true;

    double maxSpreadPoints = (EAStressSafety_MaxSpreadPips * EAStressSafety_PipSize()) / _Point;
    if(maxSpreadPoints <= 0) return true;

    return (double)spreadPoints <= maxSpreadPoints;
}

int EAStressSafety_MaxDeviationPoints()
{
    if(EAStressSafety_MaxSlippagePips <= 0) return 0;
    double points = (EAStressSafety_MaxSlippagePips * EAStressSafety_PipSize()) / _Point;
    if(points < 0) return 0;
    return (int)MathRound(points);
}

bool EAStressSafety_OrderSend(const MqlTradeRequest& request, MqlTradeResult& result)
{
    if(!EAStressSafety_IsSpreadOk())
    {
        result.retcode = 0;
        result.comment = "EAStressSafety: Spread too high";
        return false;
    }

    MqlTradeRequest req = request;

    int maxDev = EAStressSafety_MaxDeviationPoints();
    if(maxDev > 0)
    {
        if((int)req.deviation <= 0 || (int)req.deviation > maxDev)
            req.deviation = maxDev;
    }

    return OrderSend(req, result);
}

bool EAStressSafety_OrderSendAsync(const MqlTradeRequest& request, MqlTradeResult& result)
{
    if(!EAStressSafety_IsSpreadOk())
    {
        result.retcode = 0;
        result.comment = "EAStressSafety: Spread too high";
        return false;
    }

    MqlTradeRequest req = request;

    int maxDev = EAStressSafety_MaxDeviationPoints();
    if(maxDev > 0)
    {
        if((int)req.deviation <= 0 || (int)req.deviation > maxDev)
            req.deviation = maxDev;
    }

    return OrderSendAsync(req, result);
}

// Intercept all order sending, including inside the standard library
#define OrderSend EAStressSafety_OrderSend
#define OrderSendAsync EAStressSafety_OrderSendAsync

#endif
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionOutcome {
    pub original_path: PathBuf,
    pub modified_path: PathBuf,
    pub ontester_injected: bool,
    pub safety_injected: bool,
}

fn ontester_signature() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(double|int|void)\s+OnTester\s*\(\s*\)").unwrap())
}

fn directive_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#\w+.*$").unwrap())
}

pub fn has_ontester(content: &str) -> bool {
    ontester_signature().is_match(content)
}

pub fn has_safety_guards(content: &str) -> bool {
    content.contains("STRESS_TEST_MODE")
}

pub fn has_trade_safety_guards(content: &str) -> bool {
    content.contains("EAStressSafety_MaxSpreadPips")
}

fn ontester_code(min_trades: u32) -> String {
    ONTESTER_TEMPLATE.replace("{MIN_TRADES}", &min_trades.to_string())
}

/// Byte offset just past the leading `//+----+` header block, or 0.
fn header_end(content: &str) -> usize {
    if !content.trim_start().starts_with("//+") {
        return 0;
    }
    let mut offset = 0;
    for (idx, line) in content.lines().enumerate() {
        let line_len = line.len() + 1;
        let trimmed = line.trim();
        if idx > 0 && trimmed.starts_with("//+") && trimmed.ends_with('+') {
            return offset + line_len;
        }
        offset += line_len;
    }
    0
}

/// Insert the custom criterion unless the EA already defines `OnTester`.
pub fn inject_ontester(content: &str, min_trades: u32) -> (String, bool) {
    if has_ontester(content) {
        return (content.to_string(), false);
    }

    // Prefer inserting after the last preprocessor directive so the criterion
    // sees every #include.
    let insert_at = directive_line()
        .find_iter(content)
        .last()
        .map_or_else(|| header_end(content), |m| m.end());

    let mut modified = String::with_capacity(content.len() + ONTESTER_TEMPLATE.len() + 16);
    modified.push_str(&content[..insert_at]);
    modified.push_str("\n\n");
    modified.push_str(&ontester_code(min_trades));
    modified.push('\n');
    modified.push_str(&content[insert_at..]);
    (modified, true)
}

/// Insert the guard blocks; upgrades older copies that carry only one block.
pub fn inject_safety(content: &str) -> (String, bool) {
    let mut content = content.to_string();
    let mut injected = false;

    if !has_safety_guards(&content) {
        let at = header_end(&content);
        content.insert_str(at, &format!("\n{SAFETY_GUARDS}\n"));
        injected = true;
    }

    if !has_trade_safety_guards(&content) {
        // Place immediately after the safety guard block when present.
        let marker = "//| Safety Guards - injected";
        let insert_at = content.find(marker).and_then(|idx| {
            let endif = content[idx..].find("#endif")? + idx;
            let line_end = content[endif..].find('\n')? + endif;
            Some(line_end + 1)
        });

        match insert_at {
            Some(at) => content.insert_str(at, &format!("{TRADE_SAFETY_GUARDS}\n")),
            None => {
                let at = header_end(&content);
                content.insert_str(at, &format!("\n{TRADE_SAFETY_GUARDS}\n"));
            }
        }
        injected = true;
    }

    (content, injected)
}

/// Write a modified working copy of the EA with the requested injections.
/// The original file is never touched.
pub fn create_modified_ea(
    ea_path: &Path,
    inject_tester: bool,
    inject_guards: bool,
    min_trades: u32,
) -> Result<InjectionOutcome> {
    let content = std::fs::read_to_string(ea_path)
        .with_context(|| format!("reading EA source {}", ea_path.display()))?;

    let mut modified = content;
    let mut ontester_injected = false;
    let mut safety_injected = false;

    if inject_tester {
        let (next, injected) = inject_ontester(&modified, min_trades);
        modified = next;
        ontester_injected = injected;
    }
    if inject_guards {
        let (next, injected) = inject_safety(&modified);
        modified = next;
        safety_injected = injected;
    }

    let stem = ea_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("ea");
    let modified_path = ea_path.with_file_name(format!("{stem}{MODIFIED_SUFFIX}.mq5"));
    std::fs::write(&modified_path, &modified)
        .with_context(|| format!("writing modified EA {}", modified_path.display()))?;

    Ok(InjectionOutcome {
        original_path: ea_path.to_path_buf(),
        modified_path,
        ontester_injected,
        safety_injected,
    })
}

/// Delete a previously written instrumented copy and its compiled binary.
/// Refuses paths that don't carry the modified suffix, so it can never touch
/// an original source file. Returns whether the copy was removed.
pub fn remove_modified_ea(modified_path: &Path) -> bool {
    let is_modified = modified_path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.contains(MODIFIED_SUFFIX));
    if !is_modified || !modified_path.exists() {
        return false;
    }

    let removed = std::fs::remove_file(modified_path).is_ok();
    let binary = modified_path.with_extension("ex5");
    if binary.exists() {
        let _ = std::fs::remove_file(&binary);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    const BARE_EA: &str = r#"//+------------------------------------------------------------------+
//| Demo EA                                                          |
//+------------------------------------------------------------------+
#property copyright "demo"
#include <Trade/Trade.mqh>

input int Period = 14;

void OnTick()
{
}
"#;

    #[test]
    fn detects_existing_ontester() {
        assert!(!has_ontester(BARE_EA));
        let with = format!("{BARE_EA}\ndouble OnTester()\n{{ return 0; }}\n");
        assert!(has_ontester(&with));
    }

    #[test]
    fn commented_ontester_not_detected() {
        let with_comment = format!("{BARE_EA}\n// double OnTester() removed\n");
        assert!(!has_ontester(&with_comment));
    }

    #[test]
    fn injects_after_last_directive() {
        let (modified, injected) = inject_ontester(BARE_EA, 30);
        assert!(injected);
        let include_pos = modified.find("#include").unwrap();
        let ontester_pos = modified.find("double OnTester()").unwrap();
        let ontick_pos = modified.find("void OnTick()").unwrap();
        assert!(include_pos < ontester_pos);
        assert!(ontester_pos < ontick_pos);
        assert!(modified.contains("if(trades < 30) return -1000;"));
        assert!(modified.contains("if(profit <= 0) return -500;"));
    }

    #[test]
    fn injection_is_idempotent() {
        let (once, injected) = inject_ontester(BARE_EA, 30);
        assert!(injected);
        let (twice, injected_again) = inject_ontester(&once, 30);
        assert!(!injected_again);
        assert_eq!(once, twice);
    }

    #[test]
    fn safety_injection_adds_both_blocks() {
        let (modified, injected) = inject_safety(BARE_EA);
        assert!(injected);
        assert!(modified.contains("#define STRESS_TEST_MODE true"));
        assert!(modified.contains("#define WebRequest(a,b,c,d,e,f,g) false"));
        assert!(modified.contains("#define DLLCall(a,b) 0"));
        assert!(modified.contains("EAStressSafety_MaxSpreadPips"));
        assert!(modified.contains("#define OrderSend EAStressSafety_OrderSend"));

        // Trade safety lands after the guard block
        let guards = modified.find("Safety Guards - injected").unwrap();
        let trade = modified.find("Trade Safety - injected").unwrap();
        assert!(guards < trade);
    }

    #[test]
    fn safety_injection_upgrades_partial_copies() {
        let (with_guards, _) = inject_safety(BARE_EA);
        let (again, injected) = inject_safety(&with_guards);
        assert!(!injected);
        assert_eq!(with_guards, again);
    }

    #[test]
    fn create_modified_ea_writes_suffixed_copy() {
        let dir = tempfile::tempdir().unwrap();
        let ea = dir.path().join("Demo.mq5");
        std::fs::write(&ea, BARE_EA).unwrap();

        let outcome = create_modified_ea(&ea, true, true, 25).unwrap();
        assert!(outcome.ontester_injected);
        assert!(outcome.safety_injected);
        assert_eq!(
            outcome.modified_path.file_name().unwrap(),
            "Demo_stress_test.mq5"
        );

        let written = std::fs::read_to_string(&outcome.modified_path).unwrap();
        assert!(written.contains("if(trades < 25) return -1000;"));
        // Original untouched
        assert_eq!(std::fs::read_to_string(&ea).unwrap(), BARE_EA);
    }

    #[test]
    fn remove_modified_ea_deletes_copy_and_binary() {
        let dir = tempfile::tempdir().unwrap();
        let ea = dir.path().join("Demo.mq5");
        std::fs::write(&ea, BARE_EA).unwrap();

        let outcome = create_modified_ea(&ea, true, true, 30).unwrap();
        let binary = outcome.modified_path.with_extension("ex5");
        std::fs::write(&binary, b"compiled").unwrap();

        assert!(remove_modified_ea(&outcome.modified_path));
        assert!(!outcome.modified_path.exists());
        assert!(!binary.exists());
        // Idempotent once gone
        assert!(!remove_modified_ea(&outcome.modified_path));
    }

    #[test]
    fn remove_modified_ea_refuses_unsuffixed_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ea = dir.path().join("Demo.mq5");
        std::fs::write(&ea, BARE_EA).unwrap();

        assert!(!remove_modified_ea(&ea));
        assert!(ea.exists());
    }
}
