use std::sync::Arc;

use api_types::ApiResponse;
use api_types::DeviceView;
use api_types::FaultResolution;
use api_types::HardwareProfileSpec;
use api_types::ProfileValidation;
use api_types::QuotaSpec;
use api_types::SchemeSpec;
use api_types::UnitView;
use api_types::WorkloadSubmission;
use api_types::WorkloadView;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use serde::Deserialize;
use tracing::info;

use super::errors::failure;
use super::errors::validation_status;
use super::server::Readiness;
use crate::domain::admission::RequestId;
use crate::domain::engine::GovernanceEngine;
use crate::domain::inventory::DeviceId;

type ApiResult<T> = poem::Result<Json<ApiResponse<T>>>;

/// Body of a clear-fault request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearFaultRequest {
    pub resolution: FaultResolution,
}

#[handler]
pub async fn healthz() -> &'static str {
    "ok"
}

#[handler]
pub async fn readyz(readiness: Data<&Readiness>) -> poem::Result<&'static str> {
    if readiness.is_ready() {
        Ok("ready")
    } else {
        Err(poem::Error::from_string(
            "initializing",
            StatusCode::SERVICE_UNAVAILABLE,
        ))
    }
}

#[handler]
pub async fn list_units(engine: Data<&Arc<GovernanceEngine>>) -> ApiResult<Vec<UnitView>> {
    let units = engine.units();
    let message = format!("{} unit(s)", units.len());
    Ok(Json(ApiResponse::ok(units, message)))
}

#[handler]
pub async fn list_devices(engine: Data<&Arc<GovernanceEngine>>) -> ApiResult<Vec<DeviceView>> {
    let devices = engine.devices();
    let message = format!("{} device(s)", devices.len());
    Ok(Json(ApiResponse::ok(devices, message)))
}

fn device_view(engine: &GovernanceEngine, id: &DeviceId) -> Option<DeviceView> {
    engine
        .devices()
        .into_iter()
        .find(|view| view.node == id.node && view.index == id.index)
}

/// Declares the desired scheme of a device. Declarations for devices not
/// seen yet are kept until the device appears.
#[handler]
pub async fn declare_scheme(
    Path((node, index)): Path<(String, u32)>,
    engine: Data<&Arc<GovernanceEngine>>,
    Json(scheme): Json<SchemeSpec>,
) -> ApiResult<DeviceView> {
    let id = DeviceId::new(node, index);
    engine.declare_desired(&id, &scheme).await?;
    info!(device = %id, "Desired scheme declared through API");
    Ok(Json(match device_view(&engine, &id) {
        Some(view) => ApiResponse::ok(view, format!("Desired scheme of {id} declared")),
        None => ApiResponse {
            success: true,
            data: None,
            message: format!("Desired scheme of {id} recorded, device not seen yet"),
        },
    }))
}

#[handler]
pub async fn clear_fault(
    Path((node, index)): Path<(String, u32)>,
    engine: Data<&Arc<GovernanceEngine>>,
    Json(request): Json<ClearFaultRequest>,
) -> ApiResult<DeviceView> {
    let id = DeviceId::new(node, index);
    engine.clear_fault(&id, request.resolution).await?;
    let view = device_view(&engine, &id)
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, format!("Device {id} not found")))?;
    Ok(Json(ApiResponse::ok(view, format!("Fault of {id} cleared"))))
}

#[handler]
pub async fn list_profiles(engine: Data<&Arc<GovernanceEngine>>) -> ApiResult<Vec<HardwareProfileSpec>> {
    let profiles = engine.profiles();
    let message = format!("{} profile(s)", profiles.len());
    Ok(Json(ApiResponse::ok(profiles, message)))
}

#[handler]
pub async fn validate_profile(
    engine: Data<&Arc<GovernanceEngine>>,
    Json(spec): Json<HardwareProfileSpec>,
) -> ApiResult<ProfileValidation> {
    let report = engine.validate_profile(&spec);
    let message = report
        .reason
        .clone()
        .unwrap_or_else(|| format!("Profile {} is valid", spec.name));
    Ok(Json(ApiResponse::ok(report, message)))
}

/// Replaces all profiles. Invalid declarations are skipped and reported.
#[handler]
pub async fn replace_profiles(
    engine: Data<&Arc<GovernanceEngine>>,
    Json(specs): Json<Vec<HardwareProfileSpec>>,
) -> ApiResult<Vec<ProfileValidation>> {
    let reports = engine.replace_profiles(&specs).await;
    let rejected = reports.iter().filter(|r| !r.valid).count();
    Ok(Json(ApiResponse {
        success: rejected == 0,
        message: format!("{} profile(s) registered, {rejected} rejected", reports.len() - rejected),
        data: Some(reports),
    }))
}

#[handler]
pub async fn remove_profile(
    Path(name): Path<String>,
    engine: Data<&Arc<GovernanceEngine>>,
) -> ApiResult<String> {
    if !engine.remove_profile(&name).await {
        return Err(failure(
            StatusCode::NOT_FOUND,
            format!("Profile {name} not found"),
        ));
    }
    Ok(Json(ApiResponse::ok(name.clone(), format!("Profile {name} removed"))))
}

#[handler]
pub async fn replace_quotas(
    engine: Data<&Arc<GovernanceEngine>>,
    Json(specs): Json<Vec<QuotaSpec>>,
) -> ApiResult<usize> {
    engine
        .set_quotas(&specs)
        .await
        .map_err(|e| failure(validation_status(&e), e.to_string()))?;
    Ok(Json(ApiResponse::ok(specs.len(), "Quotas replaced")))
}

async fn workload_view(engine: &GovernanceEngine, id: &RequestId) -> poem::Result<WorkloadView> {
    Ok(engine.admission().view(id).await?)
}

#[handler]
pub async fn submit_workload(
    engine: Data<&Arc<GovernanceEngine>>,
    Json(mut submission): Json<WorkloadSubmission>,
) -> ApiResult<WorkloadView> {
    let id = RequestId(
        submission
            .id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone(),
    );
    engine.admission().submit(submission).await?;
    let view = workload_view(&engine, &id).await?;
    Ok(Json(ApiResponse::ok(view, format!("Workload {id} submitted"))))
}

#[handler]
pub async fn get_workload(
    Path(id): Path<String>,
    engine: Data<&Arc<GovernanceEngine>>,
) -> ApiResult<WorkloadView> {
    let id = RequestId(id);
    let view = workload_view(&engine, &id).await?;
    Ok(Json(ApiResponse::ok(view, format!("Workload {id}"))))
}

#[handler]
pub async fn cancel_workload(
    Path(id): Path<String>,
    engine: Data<&Arc<GovernanceEngine>>,
) -> ApiResult<WorkloadView> {
    let id = RequestId(id);
    engine.admission().cancel(&id).await?;
    let view = workload_view(&engine, &id).await?;
    Ok(Json(ApiResponse::ok(view, format!("Workload {id} cancelled"))))
}

#[handler]
pub async fn complete_workload(
    Path(id): Path<String>,
    engine: Data<&Arc<GovernanceEngine>>,
) -> ApiResult<WorkloadView> {
    let id = RequestId(id);
    engine.admission().complete(&id).await?;
    let view = workload_view(&engine, &id).await?;
    Ok(Json(ApiResponse::ok(view, format!("Workload {id} completed"))))
}
