//! Analysis stage: classify each record's description.

use async_trait::async_trait;
use licitai_shared::{AnalysisResult, ProcurementRecord, Result, StageOutput, Task};
use tracing::debug;

use crate::classify::{Classifier, NOT_INFORMED};
use crate::worker::StageProcessor;

/// [`StageProcessor`] for `pending → analysis-done`.
pub struct Analyzer<C> {
    classifier: C,
}

impl<C: Classifier> Analyzer<C> {
    pub fn new(classifier: C) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl<C: Classifier> StageProcessor for Analyzer<C> {
    async fn process(&self, task: &Task, record: &ProcurementRecord) -> Result<StageOutput> {
        let description = record.require_description()?;
        let classification = self.classifier.classify(description).await?;

        let sales_trigger = classification
            .sales_trigger
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| NOT_INFORMED.to_string());

        debug!(
            task_id = %task.id,
            keywords = classification.keywords.len(),
            %sales_trigger,
            "record classified"
        );

        Ok(StageOutput::Analysis(AnalysisResult {
            keywords: classification.keywords,
            sales_trigger,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classification;
    use chrono::Utc;
    use licitai_shared::SearchDefinition;

    struct StaticClassifier(Classification);

    #[async_trait]
    impl Classifier for StaticClassifier {
        async fn classify(&self, _text: &str) -> Result<Classification> {
            Ok(self.0.clone())
        }
    }

    fn record(description: Option<&str>) -> ProcurementRecord {
        ProcurementRecord {
            id: "rec-1".into(),
            description: description.map(String::from),
            modality_name: None,
            org_name: None,
            region: None,
            municipality: None,
            publication_date: None,
            external_link: None,
            synced_at: Utc::now(),
        }
    }

    fn task() -> Task {
        Task::pending("rec-1", &SearchDefinition::new("TI", "o", &["x"]))
    }

    #[tokio::test]
    async fn fills_missing_trigger() {
        let analyzer = Analyzer::new(StaticClassifier(Classification {
            keywords: vec!["servidor".into()],
            sales_trigger: Some("  ".into()),
        }));

        let output = analyzer
            .process(&task(), &record(Some("Aquisição de servidor")))
            .await
            .expect("process");
        assert_eq!(
            output,
            StageOutput::Analysis(AnalysisResult {
                keywords: vec!["servidor".into()],
                sales_trigger: NOT_INFORMED.into(),
            })
        );
    }

    #[tokio::test]
    async fn missing_description_is_data_integrity() {
        let analyzer = Analyzer::new(StaticClassifier(Classification::default()));
        let err = analyzer.process(&task(), &record(None)).await.unwrap_err();
        assert!(err.is_data_integrity());
    }
}
