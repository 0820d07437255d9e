use crate::infra::{in_process_collaborators, SimulatedCrmDelivery};
use clap::Args;
use secureflow::config::WorkflowConfig;
use secureflow::error::AppError;
use secureflow::workflows::intake::{
    DocumentUpload, IntakeService, OwnerId, OwnerProfile, RequirementCatalog, RequirementId,
    SubmissionView, WorkflowError,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Owner id used for the walkthrough submission
    #[arg(long, default_value = "demo-applicant")]
    pub(crate) owner: String,
    /// Applicant e-mail used as the reminder contact
    #[arg(long, default_value = "applicant@example.com")]
    pub(crate) email: String,
    /// Upload a local file for a requirement, as `<requirement>=<path>`.
    /// Requirements without a file get a generated sample upload.
    #[arg(long = "file", value_parser = parse_file_arg)]
    pub(crate) files: Vec<FileArg>,
    /// Number of CRM deliveries that fail with a retryable error first
    #[arg(long, default_value_t = 0)]
    pub(crate) crm_failures: u32,
    /// Simulated CRM latency in milliseconds
    #[arg(long, default_value_t = 250)]
    pub(crate) crm_latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileArg {
    pub(crate) requirement: RequirementId,
    pub(crate) path: PathBuf,
}

pub(crate) fn parse_file_arg(raw: &str) -> Result<FileArg, String> {
    let (requirement, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <requirement>=<path>, got '{raw}'"))?;
    let requirement = requirement.trim();
    let path = path.trim();
    if requirement.is_empty() || path.is_empty() {
        return Err(format!("expected <requirement>=<path>, got '{raw}'"));
    }
    Ok(FileArg {
        requirement: RequirementId::new(requirement),
        path: PathBuf::from(path),
    })
}

fn load_upload(file: &FileArg) -> Result<DocumentUpload, AppError> {
    let bytes = std::fs::read(&file.path)?;
    let file_name = file
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.requirement.to_string());
    let content_type = mime_guess::from_path(&file.path)
        .first_raw()
        .map(str::to_string);
    Ok(DocumentUpload::new(file_name, content_type, bytes))
}

fn sample_upload(requirement: &RequirementId) -> DocumentUpload {
    DocumentUpload::new(
        format!("{requirement}-sample.pdf"),
        Some("application/pdf".to_string()),
        b"%PDF-1.7 demo upload".to_vec(),
    )
}

fn print_view(view: &SubmissionView) {
    println!(
        "- Submission {} | stage {} | crm {} | {:.0}% verified",
        view.submission_id,
        view.stage_label,
        view.crm_sync_state,
        view.progress * 100.0
    );
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        owner,
        email,
        files,
        crm_failures,
        crm_latency_ms,
    } = args;

    let service = IntakeService::new(
        in_process_collaborators(SimulatedCrmDelivery::new(
            Duration::from_millis(crm_latency_ms),
            crm_failures,
        )),
        RequirementCatalog::standard(),
        WorkflowConfig::default(),
    );
    let owner_id = OwnerId(owner);

    println!("SecureFlow document collection demo");
    let view = service.open_submission(OwnerProfile {
        owner_id: owner_id.clone(),
        first_name: "Demo".to_string(),
        last_name: "Applicant".to_string(),
        email,
        phone: None,
    })?;
    print_view(&view);

    println!("\nDocument verification");
    let requirements: Vec<RequirementId> = service
        .catalog()
        .requirements()
        .iter()
        .map(|requirement| requirement.id.clone())
        .collect();
    for requirement in &requirements {
        let upload = match files.iter().find(|file| &file.requirement == requirement) {
            Some(file) => load_upload(file)?,
            None => sample_upload(requirement),
        };
        let file_name = upload.file_name.clone();
        match service.submit_document(&owner_id, requirement, upload).await {
            Ok(result) if result.verification.verified => println!(
                "  - {requirement}: {file_name} verified ({:.0}% confidence)",
                result.verification.confidence * 100.0
            ),
            Ok(result) => println!(
                "  - {requirement}: {file_name} rejected ({}); {} attempt(s) left",
                result.verification.issues.join(", "),
                result.verification.attempts_remaining
            ),
            Err(err @ WorkflowError::RetryLimitExceeded { .. }) => {
                println!("  - {requirement}: {err}")
            }
            Err(err) => return Err(err.into()),
        }
    }
    for file in &files {
        if !requirements.contains(&file.requirement) {
            println!("  - {}: not part of the checklist, skipped", file.requirement);
        }
    }

    println!("\nSignature and completion");
    let view = match service.proceed_to_signature(&owner_id) {
        Ok(view) => view,
        Err(WorkflowError::GuardNotSatisfied(err)) => {
            println!("  Cannot continue to signing: {err}");
            service.shutdown();
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    print_view(&view);
    let view = service.record_signature(&owner_id)?;
    println!(
        "  Signature captured at {}",
        view.signature
            .signed_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default()
    );

    let completion = service.complete_submission(&owner_id)?;
    print_view(&completion.submission);

    println!("\nCRM synchronization");
    if let Some(handle) = completion.sync {
        match handle.await {
            Ok(Ok(result)) => println!(
                "  Delivered as {}",
                result.external_id.as_deref().unwrap_or("<unknown>")
            ),
            Ok(Err(err)) => println!("  Sync did not finish: {err}"),
            Err(err) => println!("  Sync task aborted: {err}"),
        }
    }
    let view = service.get_submission(&owner_id)?;
    print_view(&view);
    println!("  Delivery attempts: {}", view.sync_attempts);
    if let Some(error) = &view.last_sync_error {
        println!("  Last sync error: {error}");
    }

    service.shutdown();
    Ok(())
}
