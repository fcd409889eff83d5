//! # Metrotech Storage
//!
//! Local persistence layer for the Metrotech back-office. Everything is kept
//! in a synchronous string key-value backend:
//!
//! - [`record_store::DataStorage`]: one versioned JSON document with named
//!   sections (forms, users, visits, news, settings, logs...), array helpers,
//!   export/import, backups and retention cleanup.
//! - [`file_store::FileStore`]: base64 files with per-file and aggregate quotas.
//! - [`reactive::PersistedValue`]: a typed mirror of one key that follows
//!   writes made through other handles of a [`sync::StorageHub`].
//!
//! Backends: [`backend::MemoryBackend`] and the durable
//! [`lmdb_backend::LmdbBackend`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use metrotech_storage::app_state::AppStorage;
//! use metrotech_storage::clock::SystemClock;
//! use metrotech_storage::config::StorageConfig;
//! use serde_json::json;
//!
//! let storage = AppStorage::in_memory(StorageConfig::default(), Arc::new(SystemClock))?;
//! storage.records.add_to_array("drafts", json!({"id": "f1", "title": "A"}))?;
//! storage.records.update_in_array("drafts", "f1", json!({"title": "B"}))?;
//! # Ok::<(), metrotech_storage::storage_error::StorageError>(())
//! ```
//!
//! ## FFI Functions
//!
//! Every function below returns a JSON [`AppResponse`] envelope as a C string
//! that must be released with [`free_response`]:
//!
//! - [`create_storage`] / [`close_storage`] / [`free_storage`]
//! - [`get_section`], [`save_section`], [`add_record`], [`update_record`], [`remove_record`]
//! - [`export_data`], [`import_data`], [`create_backup`], [`clean_old_data`], [`storage_stats`]
//! - [`save_file`], [`get_file`], [`delete_file`], [`list_files`]

pub mod app_response;
pub mod app_state;
pub mod backend;
pub mod clock;
pub mod config;
pub mod document;
pub mod file_store;
pub mod image_resize;
pub mod lmdb_backend;
pub mod reactive;
pub mod record;
pub mod record_store;
pub mod storage_error;
pub mod sync;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::app_response::AppResponse;
use crate::app_state::AppStorage;
use crate::config::StorageConfig;
use crate::storage_error::StorageResult;

/// Opens (or creates) the storage at `<name>.lmdb`.
///
/// Configuration comes from `METROTECH_*` environment variables; invalid
/// values fall back to the defaults with a warning.
///
/// # Returns
///
/// A pointer to the [`AppStorage`] instance, or null on failure. Release it
/// with [`free_storage`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_storage(name: *const c_char) -> *mut AppStorage {
    if name.is_null() {
        warn!("Null name pointer passed to create_storage");
        return std::ptr::null_mut();
    }

    let name_str = match unsafe { CStr::from_ptr(name).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in name parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    let config = match StorageConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring storage configuration from environment: {e}");
            StorageConfig::default()
        }
    };

    match AppStorage::open_lmdb(name_str, config) {
        Ok(storage) => {
            info!("✅ Storage '{}' initialized", name_str);
            Box::into_raw(Box::new(storage))
        }
        Err(e) => {
            warn!("❌ Failed to initialize storage '{}': {}", name_str, e);
            std::ptr::null_mut()
        }
    }
}

/// Returns the JSON value of one document section.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_section(state: *mut AppStorage, section: *const c_char) -> *const c_char {
    let state = match state_ref(state, "get_section") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let section = match c_ptr_to_string(section, "section") {
        Ok(s) => s,
        Err(err) => return err,
    };

    match state.records.get_data(&section) {
        Ok(Some(value)) => value_response(&value),
        Ok(None) => response_to_c_string(&AppResponse::NotFound(format!(
            "No section named {section}"
        ))),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Replaces one section with the given JSON value.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn save_section(
    state: *mut AppStorage,
    section: *const c_char,
    json_ptr: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "save_section") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let section = match c_ptr_to_string(section, "section") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let value = match c_ptr_to_json(json_ptr) {
        Ok(v) => v,
        Err(err) => return err,
    };

    unit_response(
        state.records.save_data(&section, value),
        format!("Section '{section}' saved"),
    )
}

/// Appends a record to an array section.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn add_record(
    state: *mut AppStorage,
    section: *const c_char,
    json_ptr: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "add_record") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let section = match c_ptr_to_string(section, "section") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let value = match c_ptr_to_json(json_ptr) {
        Ok(v) => v,
        Err(err) => return err,
    };

    unit_response(
        state.records.add_to_array(&section, value),
        format!("Record added to '{section}'"),
    )
}

/// Shallow-merges a JSON object into the record with the given id.
///
/// Answers `NotFound` when the section has no such record.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn update_record(
    state: *mut AppStorage,
    section: *const c_char,
    id: *const c_char,
    patch_ptr: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "update_record") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let section = match c_ptr_to_string(section, "section") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let id = match c_ptr_to_string(id, "id") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let patch = match c_ptr_to_json(patch_ptr) {
        Ok(v) => v,
        Err(err) => return err,
    };

    match state.records.update_in_array(&section, &id, patch) {
        Ok(true) => response_to_c_string(&AppResponse::success("Record updated successfully")),
        Ok(false) => response_to_c_string(&AppResponse::NotFound(format!(
            "No record {id} in {section}"
        ))),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Removes every record with the given id. Removing nothing still succeeds.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn remove_record(
    state: *mut AppStorage,
    section: *const c_char,
    id: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "remove_record") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let section = match c_ptr_to_string(section, "section") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let id = match c_ptr_to_string(id, "id") {
        Ok(s) => s,
        Err(err) => return err,
    };

    match state.records.remove_from_array(&section, &id) {
        Ok(count) => response_to_c_string(&AppResponse::success(format!(
            "{count} record(s) removed"
        ))),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Pretty-printed JSON of the whole document, wrapped in an `Ok` envelope.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn export_data(state: *mut AppStorage) -> *const c_char {
    let state = match state_ref(state, "export_data") {
        Ok(s) => s,
        Err(err) => return err,
    };
    string_response(state.records.export_data())
}

/// Replaces the document with an export or backup. Invalid JSON leaves the
/// stored document untouched.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn import_data(state: *mut AppStorage, json_ptr: *const c_char) -> *const c_char {
    let state = match state_ref(state, "import_data") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let json = match c_ptr_to_string(json_ptr, "JSON") {
        Ok(s) => s,
        Err(err) => return err,
    };
    unit_response(state.records.import_data(&json), "Data imported successfully".to_string())
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_backup(state: *mut AppStorage) -> *const c_char {
    let state = match state_ref(state, "create_backup") {
        Ok(s) => s,
        Err(err) => return err,
    };
    string_response(state.records.create_backup())
}

/// Runs the retention sweep; the envelope carries the cleanup report.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn clean_old_data(state: *mut AppStorage) -> *const c_char {
    let state = match state_ref(state, "clean_old_data") {
        Ok(s) => s,
        Err(err) => return err,
    };
    serialize_response(state.records.clean_old_data())
}

/// Record and file statistics in one envelope.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn storage_stats(state: *mut AppStorage) -> *const c_char {
    let state = match state_ref(state, "storage_stats") {
        Ok(s) => s,
        Err(err) => return err,
    };

    #[derive(Serialize)]
    struct Combined {
        records: record_store::StorageStats,
        files: file_store::FileStorageStats,
    }

    let combined = state.records.get_storage_stats().and_then(|records| {
        Ok(Combined {
            records,
            files: state.files.get_file_storage_stats()?,
        })
    });
    serialize_response(combined)
}

#[derive(Deserialize)]
struct FileUpload {
    id: String,
    name: String,
    #[serde(rename = "type")]
    mime_type: String,
    data: String,
}

/// Stores a file given as `{"id", "name", "type", "data"}` where `data` is a
/// base64 data URL.
///
/// Quota violations answer `QuotaExceeded`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn save_file(state: *mut AppStorage, json_ptr: *const c_char) -> *const c_char {
    let state = match state_ref(state, "save_file") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let json = match c_ptr_to_string(json_ptr, "JSON") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let upload: FileUpload = match serde_json::from_str(&json) {
        Ok(u) => u,
        Err(e) => {
            let error = AppResponse::SerializationError(format!("Invalid file JSON: {e}"));
            return response_to_c_string(&error);
        }
    };

    match state
        .files
        .save_file(&upload.id, &upload.data, &upload.name, &upload.mime_type)
    {
        Ok(record) => response_to_c_string(&AppResponse::success(format!(
            "File '{}' stored ({} bytes)",
            record.name, record.size
        ))),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_file(state: *mut AppStorage, id: *const c_char) -> *const c_char {
    let state = match state_ref(state, "get_file") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let id = match c_ptr_to_string(id, "id") {
        Ok(s) => s,
        Err(err) => return err,
    };

    match state.files.get_file(&id) {
        Ok(Some(record)) => serialize_response(Ok(record)),
        Ok(None) => response_to_c_string(&AppResponse::NotFound(format!("No file with id: {id}"))),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn delete_file(state: *mut AppStorage, id: *const c_char) -> *const c_char {
    let state = match state_ref(state, "delete_file") {
        Ok(s) => s,
        Err(err) => return err,
    };
    let id = match c_ptr_to_string(id, "id") {
        Ok(s) => s,
        Err(err) => return err,
    };

    match state.files.delete_file(&id) {
        Ok(true) => response_to_c_string(&AppResponse::success("File deleted successfully")),
        Ok(false) => response_to_c_string(&AppResponse::success("File already absent")),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn list_files(state: *mut AppStorage) -> *const c_char {
    let state = match state_ref(state, "list_files") {
        Ok(s) => s,
        Err(err) => return err,
    };
    serialize_response(state.files.get_all_files())
}

/// Releases the LMDB environment. The pointer stays valid until
/// [`free_storage`], but every later call answers `DatabaseError`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_storage(state: *mut AppStorage) -> *const c_char {
    let state = match state_ref(state, "close_storage") {
        Ok(s) => s,
        Err(err) => return err,
    };
    unit_response(state.close(), "Storage closed successfully".to_string())
}

/// Drops an instance returned by [`create_storage`]. Null is ignored.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_storage(state: *mut AppStorage) {
    if state.is_null() {
        return;
    }
    let storage = unsafe { Box::from_raw(state) };
    if let Err(e) = storage.close() {
        warn!("Error closing storage while freeing it: {e}");
    }
}

/// Frees a response string returned by any function of this library.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(ptr as *mut c_char));
    }
}

fn state_ref<'a>(state: *mut AppStorage, op: &str) -> Result<&'a AppStorage, *const c_char> {
    match unsafe { state.as_ref() } {
        Some(s) => Ok(s),
        None => {
            let error = AppResponse::BadRequest(format!("Null state pointer passed to {op}"));
            Err(response_to_c_string(&error))
        }
    }
}

fn unit_response(result: StorageResult<()>, message: String) -> *const c_char {
    match result {
        Ok(()) => response_to_c_string(&AppResponse::Ok(message)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

fn string_response(result: StorageResult<String>) -> *const c_char {
    match result {
        Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

fn value_response(value: &JsonValue) -> *const c_char {
    match serde_json::to_string(value) {
        Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

fn serialize_response<T: Serialize>(result: StorageResult<T>) -> *const c_char {
    match result {
        Ok(value) => match serde_json::to_string(&value) {
            Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
            Err(e) => response_to_c_string(&AppResponse::from(e)),
        },
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Serializes the envelope into a caller-owned C string. Null if even that
/// fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Converts a C string pointer to a Rust String, or to a ready-made
/// `BadRequest` envelope when the pointer is null or not UTF-8.
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}

fn c_ptr_to_json(ptr: *const c_char) -> Result<JsonValue, *const c_char> {
    let json = c_ptr_to_string(ptr, "JSON")?;
    serde_json::from_str(&json).map_err(|e| {
        let error = AppResponse::SerializationError(format!("Invalid JSON: {e}"));
        response_to_c_string(&error)
    })
}
