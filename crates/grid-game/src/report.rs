//! Final report synthesis.
//!
//! Once a run ends, the transcript, channel statistics and best proposal are
//! bundled into one prompt for a report writer. The report is presentation
//! only and never influences the outcome of a run.

use anyhow::Result;
use async_trait::async_trait;
use quorum_kernel::{ChannelStats, ScoredProposal};
use tracing::warn;

use crate::environment::HiddenEnvironment;

pub const REPORT_SYSTEM_PROMPT: &str = "You analyse transcripts of multi-agent communication \
    games and write concise evaluation reports.";

/// Produces the final report from the synthesis input.
#[async_trait]
pub trait ReportWriter: Send + Sync {
    async fn summarize(&self, synthesis_input: &str) -> Result<String>;
}

/// Build the text handed to the report writer.
pub fn synthesis_input(
    transcript: &str,
    stats: &ChannelStats,
    best: Option<&ScoredProposal>,
) -> Result<String> {
    let mut lines = vec![
        "Synthesize the multi-agent interaction below into a concise final report that evaluates \
         semantic/pragmatic emergent language properties (grounding, compositionality, consistency, \
         efficiency, signaling/listening, symmetry)."
            .to_string(),
        String::new(),
        "Transcript:".to_string(),
        transcript.to_string(),
        String::new(),
        "Channel stats JSON:".to_string(),
        serde_json::to_string(stats)?,
    ];

    if let Some(best) = best {
        lines.push(String::new());
        lines.push("Best Proposal JSON:".to_string());
        lines.push(HiddenEnvironment::proposal_to_wire(&best.proposal).to_string());
        lines.push(format!("Score: {:.1}%", best.score * 100.0));
    }

    Ok(lines.join("\n"))
}

/// Ask `writer` for a report. Failures are logged and yield `None`.
pub async fn write_report<W: ReportWriter + ?Sized>(
    writer: &W,
    transcript: &str,
    stats: &ChannelStats,
    best: Option<&ScoredProposal>,
) -> Option<String> {
    let input = match synthesis_input(transcript, stats, best) {
        Ok(input) => input,
        Err(e) => {
            warn!(error = %e, "Failed to build report input");
            return None;
        }
    };
    match writer.summarize(&input).await {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(error = %e, "Report synthesis failed");
            None
        }
    }
}
