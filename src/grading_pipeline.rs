//! C7: the bulk AI grading pipeline. `process_job` drives one assessment
//! through file→entity matching, bounded-concurrency multi-run grading,
//! per-question consensus and status progression, matching the teacher's
//! `workers::embedding_worker` idiom of a semaphore-gated async fan-out over
//! a persistence layer rather than a thread pool.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::assessment::{
    AiModelRun, Assessment, AssessmentConfig, AssessmentStatus, FinalisedBy, GradingResult, ResultIdentity, ResultStatus,
};
use crate::error::CoreError;
use crate::identity::IdentityContext;
use crate::llm::{Attachment, LlmClient};
use crate::store::Store;

/// One answer-sheet file handed to the pipeline by the out-of-scope
/// ingestion layer. File storage, OCR and format conversion are Non-goals
/// (spec.md §1); the pipeline only ever sees already-resolved bytes.
#[derive(Debug, Clone)]
pub struct SubmissionFile {
    pub file_ref: String,
    pub attachment: Attachment,
    /// Set only for manual-upload jobs, where the file is already scoped to
    /// a specific student or outsider and Phase 1 matching is skipped
    /// (spec.md §4.5 Phase 1 "Manual-upload jobs ... skip Phase 1").
    pub assigned_identity: Option<ResultIdentity>,
}

const NAME_EXTRACTION_PROMPT: &str = r#"You are a highly specialized data extraction AI. Find and extract the full name of the student who wrote the provided answer sheet.

Rules:
1. Extract the complete name as written (e.g. "John Smith"). Do not extract labels like "Name:", student IDs, or course titles.
2. Respond with a single JSON object with exactly one key, "studentName". If no name can be identified, its value must be null.

Respond with JSON only, no markdown code fences."#;

const ANALYTICS_SUMMARY_PROMPT: &str = r#"You are an expert educational data analyst. Write a brief, insightful summary of the assessment analytics below for the teacher.

Your response must be a short introductory sentence followed by exactly three bullet points: overall performance, a specific strength or challenge, and one actionable suggestion. Respond with Markdown text only.

Assessment analytics:
{analytics_json}
"#;

pub struct GradingPipeline {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmClient>,
    config: Config,
}

impl GradingPipeline {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmClient>, config: Config) -> Self {
        Self { store, llm, config }
    }

    /// Top-level worker entry point. Any unhandled error here sets the job
    /// to `FAILED` rather than propagating (spec.md §4.5 failure semantics).
    pub async fn process_job(&self, tenant: &IdentityContext, assessment_id: &str, files: Vec<SubmissionFile>) {
        match self.try_process_job(tenant, assessment_id, files).await {
            Ok(()) => {}
            Err(err) => {
                warn!(assessment_id, error = %err, "grading job failed");
                let now = Utc::now();
                if let Err(update_err) = self
                    .store
                    .set_assessment_status(tenant, assessment_id, AssessmentStatus::Failed, Some(&err.to_string()), now)
                    .await
                {
                    warn!(assessment_id, error = %update_err, "failed to persist job failure status");
                }
            }
        }
    }

    async fn try_process_job(&self, tenant: &IdentityContext, assessment_id: &str, files: Vec<SubmissionFile>) -> Result<(), CoreError> {
        let now = Utc::now();
        let assessment = self.store.get_assessment(tenant, assessment_id).await?;
        self.store
            .set_assessment_status(tenant, assessment_id, AssessmentStatus::Processing, None, now)
            .await?;

        let entities = self.match_files_to_entities(tenant, &assessment, files).await?;
        self.store
            .set_assessment_progress(tenant, assessment_id, entities.len() as u32, 0)
            .await?;

        self.grade_entities(tenant, &assessment, entities).await?;

        self.progress_status(tenant, assessment_id).await
    }

    /// Phase 1.
    async fn match_files_to_entities(
        &self,
        tenant: &IdentityContext,
        assessment: &Assessment,
        files: Vec<SubmissionFile>,
    ) -> Result<Vec<(SubmissionFile, ResultIdentity)>, CoreError> {
        let roster = self.store.list_roster(tenant, &assessment.config.class_id).await?;
        let mut matched = Vec::with_capacity(files.len());

        for file in files {
            let identity = if assessment.config.is_manual_upload {
                file.assigned_identity
                    .clone()
                    .ok_or_else(|| CoreError::validation(format!("manual upload file {} has no assigned identity", file.file_ref)))?
            } else {
                self.match_one_file(tenant, assessment, &roster, &file).await?
            };

            let now = Utc::now();
            for question in &assessment.config.questions {
                self.store
                    .create_result(tenant, &assessment.id, &question.id, &file.file_ref, identity.clone(), now)
                    .await?;
            }
            matched.push((file, identity));
        }

        Ok(matched)
    }

    async fn match_one_file(
        &self,
        tenant: &IdentityContext,
        assessment: &Assessment,
        roster: &[crate::domain::tenant::Student],
        file: &SubmissionFile,
    ) -> Result<ResultIdentity, CoreError> {
        let extracted_name = match self
            .llm
            .complete_vision_json(NAME_EXTRACTION_PROMPT, std::slice::from_ref(&file.attachment), 0.1, self.config.llm_max_retries, "name_extraction", None)
            .await
        {
            Ok((json, _usage)) => json.get("studentName").and_then(|v| v.as_str()).map(str::to_string),
            Err(err) => {
                warn!(file_ref = %file.file_ref, error = %err, "name extraction failed");
                None
            }
        };
        let extracted_name = extracted_name.unwrap_or_else(|| "Unknown Student".to_string());
        let needle = extracted_name.to_lowercase();

        if let Some(student) = roster.iter().find(|s| {
            let haystack = s.name.to_lowercase();
            haystack.contains(&needle) || needle.contains(&haystack)
        }) {
            return Ok(ResultIdentity::Student { student_id: student.id.clone() });
        }

        let existing = self.store.list_outsiders(tenant, &assessment.id).await?;
        let outsider = match existing.into_iter().find(|o| o.submitted_name.eq_ignore_ascii_case(&extracted_name)) {
            Some(outsider) => outsider,
            None => self.store.create_outsider(tenant, &assessment.id, &extracted_name).await?,
        };
        Ok(ResultIdentity::Outsider { outsider_id: outsider.id })
    }

    /// Phase 2 and 3, interleaved per entity: grade, then reconcile
    /// consensus for that entity's questions before moving to the next.
    async fn grade_entities(&self, tenant: &IdentityContext, assessment: &Assessment, entities: Vec<(SubmissionFile, ResultIdentity)>) -> Result<(), CoreError> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.grading_concurrency));
        let total = entities.len() as u32;
        let mut handles = Vec::with_capacity(entities.len());

        for (file, identity) in entities {
            let semaphore = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let llm = Arc::clone(&self.llm);
            let tenant = tenant.clone();
            let assessment_id = assessment.id.clone();
            let config = assessment.config.clone();
            let pipeline_config = self.config.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => return Err(CoreError::transient(err.to_string())),
                };
                grade_one_entity(&store, &llm, &tenant, &assessment_id, &config, &pipeline_config, &file, &identity).await
            }));
        }

        let mut processed = 0u32;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(assessment_id = %assessment.id, error = %err, "entity grading failed"),
                Err(join_err) => warn!(assessment_id = %assessment.id, error = %join_err, "entity grading task panicked"),
            }
            processed += 1;
            self.store
                .set_assessment_progress(tenant, &assessment.id, total, processed)
                .await?;
        }
        Ok(())
    }

    /// Phase 4.
    async fn progress_status(&self, tenant: &IdentityContext, assessment_id: &str) -> Result<(), CoreError> {
        let assessment = self.store.get_assessment(tenant, assessment_id).await?;
        let results = self.store.list_results(tenant, assessment_id).await?;

        if results.iter().any(|r| r.status == ResultStatus::PendingReview) {
            self.store
                .set_assessment_status(tenant, assessment_id, AssessmentStatus::PendingReview, None, Utc::now())
                .await?;
            return Ok(());
        }

        self.store
            .set_assessment_status(tenant, assessment_id, AssessmentStatus::Summarising, None, Utc::now())
            .await?;

        let analytics = compute_analytics(&results, &assessment.config);
        let prompt = ANALYTICS_SUMMARY_PROMPT.replace("{analytics_json}", &analytics.to_string());
        let narrative = match self.llm.complete_text(&prompt, 0.5).await {
            Ok((text, _usage)) => text,
            Err(err) => {
                warn!(assessment_id, error = %err, "analytics narrative generation failed");
                String::new()
            }
        };
        if !narrative.is_empty() {
            self.store.set_assessment_narrative(tenant, assessment_id, &narrative).await?;
        }

        self.store
            .set_assessment_status(tenant, assessment_id, AssessmentStatus::Completed, None, Utc::now())
            .await?;
        info!(assessment_id, "grading job completed");
        Ok(())
    }

    /// Phase 5.
    pub async fn apply_teacher_edit(
        &self,
        tenant: &IdentityContext,
        assessment_id: &str,
        result_id: &str,
        grade: f64,
        feedback: Option<&str>,
    ) -> Result<GradingResult, CoreError> {
        let assessment = self.store.get_assessment(tenant, assessment_id).await?;
        let result = self.store.get_result(tenant, result_id).await?;
        let max_score = assessment
            .config
            .question(&result.question_id)
            .map(|q| q.max_score)
            .ok_or_else(|| CoreError::not_found(format!("question {} not found in assessment config", result.question_id)))?;
        if !(0.0..=max_score).contains(&grade) {
            return Err(CoreError::validation(format!("grade {grade} outside [0, {max_score}]")));
        }

        let now = Utc::now();
        let result = self
            .store
            .finalise_result(tenant, result_id, ResultStatus::TeacherGraded, Some(grade), feedback, Some(FinalisedBy::Teacher), now)
            .await?;

        let remaining = self.store.list_results(tenant, assessment_id).await?;
        if !remaining.iter().any(|r| r.status == ResultStatus::PendingReview) {
            self.store
                .set_assessment_status(tenant, assessment_id, AssessmentStatus::Completed, None, now)
                .await?;
        }

        Ok(result)
    }
}

async fn grade_one_entity(
    store: &Arc<dyn Store>,
    llm: &Arc<dyn LlmClient>,
    tenant: &IdentityContext,
    assessment_id: &str,
    config: &AssessmentConfig,
    pipeline_config: &Config,
    file: &SubmissionFile,
    identity: &ResultIdentity,
) -> Result<(), CoreError> {
    debug!(assessment_id, file_ref = %file.file_ref, "grading entity");
    let prompt = build_grading_prompt(config);
    let results_for_file = store
        .list_results(tenant, assessment_id)
        .await?
        .into_iter()
        .filter(|r| r.file_ref == file.file_ref)
        .collect::<Vec<_>>();

    let mut handles = Vec::with_capacity(pipeline_config.grading_runs_per_entity);
    for run_index in 0..pipeline_config.grading_runs_per_entity {
        let llm = Arc::clone(llm);
        let prompt = prompt.clone();
        let attachment = file.attachment.clone();
        let stagger = pipeline_config.grading_run_stagger * run_index as u32;
        let max_retries = pipeline_config.llm_max_retries;
        handles.push(tokio::spawn(async move {
            if run_index > 0 {
                tokio::time::sleep(stagger).await;
            }
            let outcome = llm
                .complete_vision_json(&prompt, std::slice::from_ref(&attachment), 0.1, max_retries, "grading", None)
                .await;
            (run_index, outcome)
        }));
    }

    let mut runs_by_question: HashMap<String, Vec<AiModelRun>> = HashMap::new();
    for handle in handles {
        let (run_index, outcome) = handle.await.map_err(|e| CoreError::transient(e.to_string()))?;
        match outcome {
            Ok((json, _usage)) => {
                let entries = json.get("results").and_then(|v| v.as_array()).cloned().unwrap_or_default();
                for entry in entries {
                    let Some(question_id) = entry.get("question_id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let run = AiModelRun {
                        run_index: run_index as u32,
                        extracted_answer: entry.get("extracted_answer").and_then(|v| v.as_str()).map(String::from),
                        score: entry.get("grade").and_then(|v| v.as_f64()),
                        feedback: entry.get("feedback").and_then(|v| v.as_str()).map(String::from),
                        error: None,
                    };
                    runs_by_question.entry(question_id.to_string()).or_default().push(run);
                }
            }
            Err(err) => {
                for result in &results_for_file {
                    let run = AiModelRun {
                        run_index: run_index as u32,
                        extracted_answer: None,
                        score: None,
                        feedback: None,
                        error: Some(err.to_string()),
                    };
                    runs_by_question.entry(result.question_id.clone()).or_default().push(run);
                }
            }
        }
    }

    for result in &results_for_file {
        let runs = runs_by_question.remove(&result.question_id).unwrap_or_default();
        for run in &runs {
            store.record_ai_run(tenant, &result.id, run.clone()).await?;
        }

        let now = Utc::now();
        let consensus = consensus_for_question(&runs);
        store
            .finalise_result(tenant, &result.id, consensus.status, consensus.grade, consensus.feedback.as_deref(), consensus.finalised_by, now)
            .await?;
    }

    identity_log(identity);
    Ok(())
}

fn identity_log(identity: &ResultIdentity) {
    match identity {
        ResultIdentity::Student { student_id } => debug!(student_id, "entity graded"),
        ResultIdentity::Outsider { outsider_id } => debug!(outsider_id, "entity graded"),
    }
}

fn build_grading_prompt(config: &AssessmentConfig) -> String {
    let mut sections = String::new();
    for question in &config.questions {
        let rubric = question.rubric.as_deref().unwrap_or("Grade holistically for correctness and completeness.");
        let answer_key = question
            .answer
            .as_deref()
            .map(|a| format!("Answer key: {a}"))
            .unwrap_or_else(|| "No answer key was provided; grade by general subject-matter knowledge.".to_string());
        sections.push_str(&format!(
            "Question {id}: {text}\nRubric: {rubric}\nMax score: {max}\n{answer_key}\n\n",
            id = question.id,
            text = question.text,
            max = question.max_score,
        ));
    }

    format!(
        "You are an experienced, objective teaching assistant grading a scanned handwritten answer sheet against the rubric below. \
Base every grade strictly on the rubric, not outside knowledge unless no answer key is given. For every question, extract the \
student's written answer, assign a numeric grade out of its max score, and give brief constructive feedback referencing the rubric.\n\n\
{sections}\
Respond with a single JSON object of the shape {{\"results\": [{{\"question_id\": string, \"extracted_answer\": string, \"grade\": number, \"feedback\": string}}, ...]}}, one entry per question listed above. Respond with JSON only, no markdown code fences."
    )
}

struct Consensus {
    grade: Option<f64>,
    feedback: Option<String>,
    status: ResultStatus,
    finalised_by: Option<FinalisedBy>,
}

/// Reproduces `finalize_question` exactly: greedy single-linkage clustering
/// by `|gi - gj| <= 0.1` against *any* existing member of a group (not just
/// its first), first group to reach size ≥ 2 wins, final grade is that
/// group's mean rounded to 2 decimals, feedback is its first member's.
fn consensus_for_question(runs: &[AiModelRun]) -> Consensus {
    let valid: Vec<(f64, Option<String>)> = runs.iter().filter_map(|r| r.score.map(|g| (g, r.feedback.clone()))).collect();
    if valid.len() < 2 {
        return Consensus { grade: None, feedback: None, status: ResultStatus::PendingReview, finalised_by: None };
    }

    let mut groups: Vec<Vec<(f64, Option<String>)>> = Vec::new();
    for (grade, feedback) in valid {
        let existing_group = groups.iter().position(|group| group.iter().any(|(g, _)| (grade - g).abs() <= 0.1));
        match existing_group {
            Some(idx) => groups[idx].push((grade, feedback)),
            None => groups.push(vec![(grade, feedback)]),
        }
    }

    for group in &groups {
        if group.len() >= 2 {
            let total: f64 = group.iter().map(|(g, _)| g).sum();
            let avg = (total / group.len() as f64 * 100.0).round() / 100.0;
            return Consensus {
                grade: Some(avg),
                feedback: group[0].1.clone(),
                status: ResultStatus::AiGraded,
                finalised_by: Some(FinalisedBy::Ai),
            };
        }
    }

    Consensus { grade: None, feedback: None, status: ResultStatus::PendingReview, finalised_by: None }
}

fn compute_analytics(results: &[GradingResult], config: &AssessmentConfig) -> serde_json::Value {
    let max_total = config.max_score_total().max(1.0);
    let mut per_entity_total: HashMap<String, f64> = HashMap::new();
    for result in results {
        if let Some(score) = result.score {
            let key = match &result.identity {
                ResultIdentity::Student { student_id } => student_id.clone(),
                ResultIdentity::Outsider { outsider_id } => outsider_id.clone(),
            };
            *per_entity_total.entry(key).or_insert(0.0) += score;
        }
    }

    let mut totals: Vec<f64> = per_entity_total.values().map(|t| t / max_total * 100.0).collect();
    totals.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let class_average = if totals.is_empty() { 0.0 } else { totals.iter().sum::<f64>() / totals.len() as f64 };
    let median_grade = if totals.is_empty() {
        0.0
    } else if totals.len() % 2 == 0 {
        (totals[totals.len() / 2 - 1] + totals[totals.len() / 2]) / 2.0
    } else {
        totals[totals.len() / 2]
    };

    let mut distribution = HashMap::from([("A", 0u32), ("B", 0), ("C", 0), ("D", 0), ("F", 0)]);
    for pct in &totals {
        let letter = if *pct >= 90.0 {
            "A"
        } else if *pct >= 80.0 {
            "B"
        } else if *pct >= 70.0 {
            "C"
        } else if *pct >= 60.0 {
            "D"
        } else {
            "F"
        };
        *distribution.get_mut(letter).unwrap() += 1;
    }

    let mut performance_by_question = Vec::new();
    for question in &config.questions {
        let scores: Vec<f64> = results
            .iter()
            .filter(|r| r.question_id == question.id)
            .filter_map(|r| r.score)
            .collect();
        let average_pct = if scores.is_empty() || question.max_score == 0.0 {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64 / question.max_score * 100.0
        };
        performance_by_question.push(serde_json::json!({
            "questionId": question.id,
            "averagePercentage": average_pct,
        }));
    }

    serde_json::json!({
        "classAverage": class_average,
        "medianGrade": median_grade,
        "gradeDistribution": distribution,
        "performanceByQuestion": performance_by_question,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::assessment::{AssessmentQuestion, ScoringMethod};
    use crate::llm::test_support::ScriptedLlmClient;
    use crate::llm::Attachment;
    use crate::store::memory::MemoryStore;
    use proptest::prelude::*;
    use std::time::Duration;

    fn run(run_index: u32, grade: f64, feedback: &str) -> AiModelRun {
        AiModelRun {
            run_index,
            extracted_answer: Some("42".into()),
            score: Some(grade),
            feedback: Some(feedback.into()),
            error: None,
        }
    }

    #[test]
    fn consensus_needs_at_least_two_valid_runs() {
        let runs = [run(0, 8.0, "good")];
        let consensus = consensus_for_question(&runs);
        assert_eq!(consensus.status, ResultStatus::PendingReview);
        assert_eq!(consensus.grade, None);
    }

    #[test]
    fn consensus_picks_the_majority_cluster() {
        let runs = [run(0, 8.0, "good work"), run(1, 8.05, "solid"), run(2, 3.0, "way off")];
        let consensus = consensus_for_question(&runs);
        assert_eq!(consensus.status, ResultStatus::AiGraded);
        assert!((consensus.grade.unwrap() - 8.025).abs() < 0.01);
        assert_eq!(consensus.feedback.as_deref(), Some("good work"));
        assert_eq!(consensus.finalised_by, Some(FinalisedBy::Ai));
    }

    #[test]
    fn consensus_falls_back_to_pending_review_when_all_runs_disagree() {
        let runs = [run(0, 2.0, "a"), run(1, 5.0, "b"), run(2, 9.0, "c")];
        let consensus = consensus_for_question(&runs);
        assert_eq!(consensus.status, ResultStatus::PendingReview);
        assert_eq!(consensus.grade, None);
        assert_eq!(consensus.finalised_by, None);
    }

    fn config(class_id: &str) -> AssessmentConfig {
        AssessmentConfig {
            assessment_name: "Midterm".into(),
            class_id: class_id.to_string(),
            scoring_method: ScoringMethod::PerQuestion,
            questions: vec![AssessmentQuestion {
                id: "q1".into(),
                text: "Explain photosynthesis".into(),
                rubric: Some("Award full credit for mentioning sunlight and chlorophyll.".into()),
                max_score: 10.0,
                answer: None,
            }],
            include_improvement_tips: false,
            is_manual_upload: false,
        }
    }

    fn test_pipeline_config() -> Config {
        Config {
            grading_concurrency: 1,
            grading_runs_per_entity: 3,
            grading_run_stagger: Duration::from_millis(0),
            llm_max_retries: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn process_job_matches_grades_and_completes() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("school-a");
        let class = store.seed_class(tenant.tenant_id(), "Biology 101");
        store.seed_student(tenant.tenant_id(), "Alice Smith", "ext-1");

        let assessment = store.create_assessment(&tenant, config(&class.id), Utc::now()).await.unwrap();

        let llm = Arc::new(
            ScriptedLlmClient::new([
                Ok(serde_json::json!({"studentName": "Alice"})),
                Ok(serde_json::json!({"results": [{"question_id": "q1", "extracted_answer": "Plants use light.", "grade": 8.0, "feedback": "good"}]})),
                Ok(serde_json::json!({"results": [{"question_id": "q1", "extracted_answer": "Plants use light.", "grade": 8.1, "feedback": "solid"}]})),
                Ok(serde_json::json!({"results": [{"question_id": "q1", "extracted_answer": "Plants use light.", "grade": 3.0, "feedback": "off"}]})),
            ])
            .with_text_response("Class did well overall."),
        );

        let pipeline = GradingPipeline::new(store.clone(), llm, test_pipeline_config());
        let file = SubmissionFile {
            file_ref: "sheet-1.png".into(),
            attachment: Attachment::new(vec![0, 1, 2, 3], "image/png"),
            assigned_identity: None,
        };

        pipeline.process_job(&tenant, &assessment.id, vec![file]).await;

        let assessment = store.get_assessment(&tenant, &assessment.id).await.unwrap();
        assert_eq!(assessment.status, AssessmentStatus::Completed);
        assert_eq!(assessment.narrative.as_deref(), Some("Class did well overall."));

        let results = store.list_results(&tenant, &assessment.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ResultStatus::AiGraded);
        assert!((results[0].score.unwrap() - 8.05).abs() < 0.01);
        assert!(matches!(results[0].identity, ResultIdentity::Student { .. }));
    }

    #[tokio::test]
    async fn process_job_leaves_disagreeing_entity_pending_review() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("school-b");
        let class = store.seed_class(tenant.tenant_id(), "Biology 101");

        let assessment = store.create_assessment(&tenant, config(&class.id), Utc::now()).await.unwrap();

        let llm = Arc::new(ScriptedLlmClient::new([
            Ok(serde_json::json!({"studentName": null})),
            Ok(serde_json::json!({"results": [{"question_id": "q1", "extracted_answer": "x", "grade": 2.0, "feedback": "a"}]})),
            Ok(serde_json::json!({"results": [{"question_id": "q1", "extracted_answer": "x", "grade": 5.0, "feedback": "b"}]})),
            Ok(serde_json::json!({"results": [{"question_id": "q1", "extracted_answer": "x", "grade": 9.0, "feedback": "c"}]})),
        ]));

        let pipeline = GradingPipeline::new(store.clone(), llm, test_pipeline_config());
        let file = SubmissionFile {
            file_ref: "sheet-2.png".into(),
            attachment: Attachment::new(vec![9, 9, 9], "image/png"),
            assigned_identity: None,
        };

        pipeline.process_job(&tenant, &assessment.id, vec![file]).await;

        let assessment = store.get_assessment(&tenant, &assessment.id).await.unwrap();
        assert_eq!(assessment.status, AssessmentStatus::PendingReview);

        let results = store.list_results(&tenant, &assessment.id).await.unwrap();
        assert_eq!(results[0].status, ResultStatus::PendingReview);
        assert!(matches!(results[0].identity, ResultIdentity::Outsider { .. }));
    }

    #[tokio::test]
    async fn apply_teacher_edit_completes_job_once_no_reviews_remain() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("school-c");
        let class = store.seed_class(tenant.tenant_id(), "Biology 101");
        let assessment = store.create_assessment(&tenant, config(&class.id), Utc::now()).await.unwrap();
        let result = store
            .create_result(&tenant, &assessment.id, "q1", "sheet-3.png", ResultIdentity::Outsider { outsider_id: "unknown".into() }, Utc::now())
            .await
            .unwrap();
        store
            .finalise_result(&tenant, &result.id, ResultStatus::PendingReview, None, None, None, Utc::now())
            .await
            .unwrap();
        store
            .set_assessment_status(&tenant, &assessment.id, AssessmentStatus::PendingReview, None, Utc::now())
            .await
            .unwrap();

        let llm = Arc::new(ScriptedLlmClient::new([]));
        let pipeline = GradingPipeline::new(store.clone(), llm, test_pipeline_config());

        let edited = pipeline.apply_teacher_edit(&tenant, &assessment.id, &result.id, 7.5, Some("manual review")).await.unwrap();
        assert_eq!(edited.status, ResultStatus::TeacherGraded);
        assert_eq!(edited.finalised_by, Some(FinalisedBy::Teacher));

        let assessment = store.get_assessment(&tenant, &assessment.id).await.unwrap();
        assert_eq!(assessment.status, AssessmentStatus::Completed);
    }

    #[tokio::test]
    async fn apply_teacher_edit_rejects_grade_outside_question_range() {
        let store = Arc::new(MemoryStore::new());
        let tenant = IdentityContext::new("school-d");
        let class = store.seed_class(tenant.tenant_id(), "Biology 101");
        let assessment = store.create_assessment(&tenant, config(&class.id), Utc::now()).await.unwrap();
        let result = store
            .create_result(&tenant, &assessment.id, "q1", "sheet-4.png", ResultIdentity::Outsider { outsider_id: "unknown".into() }, Utc::now())
            .await
            .unwrap();

        let pipeline = GradingPipeline::new(store.clone(), Arc::new(ScriptedLlmClient::new([])), test_pipeline_config());
        let err = pipeline.apply_teacher_edit(&tenant, &assessment.id, &result.id, 15.0, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    proptest::proptest! {
        /// Any two runs within the 0.1 clustering tolerance always produce
        /// an `AiGraded` consensus whose grade falls between them,
        /// regardless of what a third, possibly wild, run reports.
        #[test]
        fn consensus_of_agreeing_pair_is_bounded_by_their_values(
            base in -1000.0f64..1000.0,
            wobble in -0.1f64..0.1,
            outlier in -1000.0f64..1000.0,
        ) {
            let runs = [run(0, base, "a"), run(1, base + wobble, "b"), run(2, outlier, "c")];
            let consensus = consensus_for_question(&runs);
            if (outlier - base).abs() > 0.1 && (outlier - (base + wobble)).abs() > 0.1 {
                let grade = consensus.grade.expect("two agreeing runs must produce a consensus grade");
                let lo = base.min(base + wobble);
                let hi = base.max(base + wobble);
                prop_assert!(grade >= lo - 0.01 && grade <= hi + 0.01);
                prop_assert_eq!(consensus.status, ResultStatus::AiGraded);
            }
        }
    }
}
