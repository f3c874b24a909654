//! vSphere SOAP/XML envelope construction and parsing, scoped to the
//! operations `VmwareSession` needs (SPEC_FULL.md §4.2c). Uses
//! `quick-xml` for both directions rather than a general SOAP client —
//! vCenter's WSDL surface is far larger than this engine touches.

use quick_xml::events::{BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::Writer;
use reqwest::Client;

use crate::vmware::ChangedArea;

/// A parsed VMware fault or malformed-response condition.
#[derive(Debug, thiserror::Error)]
pub enum SoapError {
    #[error("vCenter returned a SOAP fault: {0}")]
    Fault(String),
    #[error("malformed vCenter response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

const ENVELOPE_OPEN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:vim25="urn:vim25" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<soapenv:Body>"#;
const ENVELOPE_CLOSE: &str = "</soapenv:Body></soapenv:Envelope>";

/// POSTs a SOAP body to `<base_url>` with the given `SOAPAction`, and
/// returns the raw response text. vCenter faults are surfaced as
/// `SoapError::Fault` here so callers never need to parse XML twice.
pub async fn post(
    client: &Client,
    base_url: &str,
    action: &str,
    body: &str,
) -> Result<String, SoapError> {
    let envelope = format!("{ENVELOPE_OPEN}{body}{ENVELOPE_CLOSE}");

    let response = client
        .post(base_url)
        .header("Content-Type", "text/xml; charset=utf-8")
        .header("SOAPAction", format!("urn:vim25/{action}"))
        .body(envelope)
        .send()
        .await?;

    let text = response.text().await?;
    if text.contains("soapenv:Fault") || text.contains("<faultstring>") {
        let message = extract_tag(&text, "faultstring").unwrap_or_else(|| text.clone());
        return Err(SoapError::Fault(message));
    }
    Ok(text)
}

/// Escapes `&`, `<`, `>` for inclusion in XML text content.
fn xml_escape(s: &str) -> String {
    let mut writer = Writer::new(Vec::new());
    let _ = writer.write_event(Event::Text(BytesText::new(s)));
    String::from_utf8(writer.into_inner()).unwrap_or_else(|_| s.to_owned())
}

pub fn build_login_envelope(user: &str, password: &str) -> String {
    format!(
        r#"<vim25:Login><_this type="SessionManager">SessionManager</_this><userName>{}</userName><password>{}</password></vim25:Login>"#,
        xml_escape(user),
        xml_escape(password)
    )
}

pub fn parse_login_response(body: &str) -> Result<(), SoapError> {
    if body.contains("LoginResponse") {
        Ok(())
    } else {
        Err(SoapError::Malformed("no LoginResponse element".to_owned()))
    }
}

pub fn build_find_by_inventory_path(search_index: &str, path: &str) -> String {
    format!(
        r#"<vim25:FindByInventoryPath><_this type="SearchIndex">{search_index}</_this><inventoryPath>{}</inventoryPath></vim25:FindByInventoryPath>"#,
        xml_escape(path)
    )
}

pub fn parse_moref(body: &str) -> Result<Option<String>, SoapError> {
    Ok(extract_tag(body, "returnval"))
}

/// Builds a `RetrieveProperties` request that, via a `TraversalSpec` on
/// `Folder.childEntity`, lists the `name` of every direct child of
/// `parent_moref`.
pub fn build_list_children(parent_moref: &str) -> String {
    format!(
        r#"<vim25:RetrieveProperties><_this type="PropertyCollector">propertyCollector</_this><specSet><propSet><type>ManagedEntity</type><pathSet>name</pathSet></propSet><objectSet><obj type="Folder">{parent_moref}</obj><skip>true</skip><selectSet xsi:type="TraversalSpec"><name>folderTraversal</name><type>Folder</type><path>childEntity</path><skip>false</skip></selectSet></objectSet></specSet></vim25:RetrieveProperties>"#
    )
}

pub fn parse_child_names(body: &str) -> Result<Vec<String>, SoapError> {
    Ok(extract_all_tags(body, "name"))
}

pub fn build_retrieve_vm_properties(moref: &str) -> String {
    format!(
        r#"<vim25:RetrieveProperties><_this type="PropertyCollector">propertyCollector</_this><specSet><propSet><type>VirtualMachine</type><pathSet>config.hardware.device</pathSet><pathSet>config.guestFullName</pathSet><pathSet>config.guestId</pathSet><pathSet>config.firmware</pathSet><pathSet>runtime.powerState</pathSet></propSet><objectSet><obj type="VirtualMachine">{moref}</obj></objectSet></specSet></vim25:RetrieveProperties>"#
    )
}

/// Flattened properties extracted from a VM's `RetrieveProperties`
/// response.
pub struct VmProperties {
    pub guest_full_name: String,
    pub guest_id: String,
    pub firmware: String,
    pub power_state: String,
    pub disks: Vec<DiskProperties>,
}

/// One disk device's properties as extracted from the hardware device
/// list.
pub struct DiskProperties {
    pub key: i32,
    pub capacity_bytes: u64,
    pub datastore: String,
    pub backing_path: String,
    pub change_id: Option<String>,
}

pub fn parse_vm_properties(body: &str) -> Result<VmProperties, SoapError> {
    let guest_full_name = extract_tag(body, "guestFullName").unwrap_or_default();
    let guest_id = extract_tag(body, "guestId").unwrap_or_default();
    let firmware = extract_tag(body, "firmware").unwrap_or_default();
    let power_state = extract_tag(body, "powerState").unwrap_or_default();
    let disks = parse_disk_devices(body);
    Ok(VmProperties {
        guest_full_name,
        guest_id,
        firmware,
        power_state,
        disks,
    })
}

/// Parses each `<VirtualDisk>` device block in hardware-device order.
fn parse_disk_devices(body: &str) -> Vec<DiskProperties> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut disks = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(tag)) if tag.name().as_ref() == b"VirtualDisk" => {
                if let Some(disk) = parse_one_disk_block(&mut reader) {
                    disks.push(disk);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        buf.clear();
    }
    disks
}

/// Extracts the datastore name from a `fileName` value of the form
/// `[datastore] path/to/vm.vmdk`.
fn datastore_from_file_name(file_name: &str) -> Option<String> {
    let rest = file_name.strip_prefix('[')?;
    let end = rest.find(']')?;
    Some(rest[..end].to_owned())
}

fn parse_one_disk_block(reader: &mut Reader<&[u8]>) -> Option<DiskProperties> {
    let mut key = None;
    let mut capacity_bytes = None;
    let mut datastore = String::new();
    let mut backing_path = String::new();
    let mut change_id = None;
    let mut buf = Vec::new();
    let mut current_tag = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(tag)) => {
                current_tag = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
            }
            Ok(Event::Text(text)) => {
                let value = text.unescape().unwrap_or_default().into_owned();
                match current_tag.as_str() {
                    "key" => key = value.parse().ok(),
                    "capacityInKB" => {
                        capacity_bytes = value.parse::<u64>().ok().map(|kb| kb * 1024);
                    }
                    "fileName" => {
                        datastore = datastore_from_file_name(&value).unwrap_or_default();
                        backing_path = value;
                    }
                    "changeId" => change_id = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(tag)) if tag.name().as_ref() == b"VirtualDisk" => break,
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    Some(DiskProperties {
        key: key?,
        capacity_bytes: capacity_bytes?,
        datastore,
        backing_path,
        change_id,
    })
}

pub fn build_power_off(moref: &str) -> String {
    format!(r#"<vim25:PowerOffVM_Task><_this type="VirtualMachine">{moref}</_this></vim25:PowerOffVM_Task>"#)
}

pub fn build_create_snapshot(moref: &str, name: &str) -> String {
    format!(
        r#"<vim25:CreateSnapshot_Task><_this type="VirtualMachine">{moref}</_this><name>{}</name><description></description><memory>false</memory><quiesce>false</quiesce></vim25:CreateSnapshot_Task>"#,
        xml_escape(name)
    )
}

pub fn build_remove_snapshot(snapshot_moref: &str) -> String {
    format!(
        r#"<vim25:RemoveSnapshot_Task><_this type="VirtualMachineSnapshot">{snapshot_moref}</_this><removeChildren>false</removeChildren><consolidate>true</consolidate></vim25:RemoveSnapshot_Task>"#
    )
}

/// Requests the full hardware device list of `snapshot_moref`; the
/// caller filters the response to one disk's backing info by key via
/// [`parse_backing_info`], since vCenter has no per-device filter here.
pub fn build_retrieve_backing_info(snapshot_moref: &str) -> String {
    format!(
        r#"<vim25:RetrieveProperties><_this type="PropertyCollector">propertyCollector</_this><specSet><propSet><type>VirtualMachineSnapshot</type><pathSet>config.hardware.device</pathSet></propSet><objectSet><obj type="VirtualMachineSnapshot">{snapshot_moref}</obj></objectSet></specSet></vim25:RetrieveProperties>"#
    )
}

/// The four `VirtualDisk*BackingInfo` variants (spec.md §4.2, §9
/// "Polymorphic backing info"), differing only in where `changeId`
/// lives. Modeled as one tagged enum with a single accessor rather than
/// four near-identical structs.
pub enum BackingInfo {
    FlatV2 { change_id: Option<String> },
    SparseV2 { change_id: Option<String> },
    RdmV1 { change_id: Option<String> },
    RdmV2 { change_id: Option<String> },
}

impl BackingInfo {
    #[must_use]
    pub fn change_id(&self) -> Option<String> {
        match self {
            Self::FlatV2 { change_id }
            | Self::SparseV2 { change_id }
            | Self::RdmV1 { change_id }
            | Self::RdmV2 { change_id } => change_id.clone(),
        }
    }
}

/// Parses every `<VirtualDisk>` device block's `key` and backing info
/// (its `<backing xsi:type="...">` variant and `changeId`), and returns
/// the one matching `disk_key`. A `RetrieveProperties` response for a
/// multi-disk VM contains one block per disk; returning the first
/// `changeId` found anywhere in the body (instead of filtering by key)
/// would silently hand back another disk's change-id.
pub fn parse_backing_info(body: &str, disk_key: i32) -> Result<BackingInfo, SoapError> {
    parse_disk_backings(body)
        .into_iter()
        .find(|(key, _)| *key == disk_key)
        .map(|(_, backing)| backing)
        .ok_or_else(|| SoapError::Malformed(format!("no backing info for disk key {disk_key}")))
}

fn parse_disk_backings(body: &str) -> Vec<(i32, BackingInfo)> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut out = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(tag)) if tag.name().as_ref() == b"VirtualDisk" => {
                if let Some(entry) = parse_one_backing_block(&mut reader) {
                    out.push(entry);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        buf.clear();
    }
    out
}

fn parse_one_backing_block(reader: &mut Reader<&[u8]>) -> Option<(i32, BackingInfo)> {
    let mut key = None;
    let mut change_id = None;
    let mut backing_type = String::new();
    let mut buf = Vec::new();
    let mut current_tag = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(tag)) => {
                let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                if name == "backing" {
                    for attr in tag.attributes().flatten() {
                        if local_name_matches(attr.key.as_ref(), "type") {
                            backing_type = String::from_utf8_lossy(&attr.value).into_owned();
                        }
                    }
                }
                current_tag = name;
            }
            Ok(Event::Text(text)) => {
                let value = text.unescape().unwrap_or_default().into_owned();
                match current_tag.as_str() {
                    "key" => key = value.parse().ok(),
                    "changeId" => change_id = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(tag)) if tag.name().as_ref() == b"VirtualDisk" => break,
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    let key = key?;
    let backing = match backing_type.as_str() {
        t if t.contains("SparseVer2") => BackingInfo::SparseV2 { change_id },
        t if t.contains("RawDiskMappingVer1") => BackingInfo::RdmV1 { change_id },
        t if t.contains("RawDiskVer2") || t.contains("RawDiskMappingVer2") => {
            BackingInfo::RdmV2 { change_id }
        }
        _ => BackingInfo::FlatV2 { change_id },
    };
    Some((key, backing))
}

pub fn build_query_changed_disk_areas(
    vm_moref: &str,
    snapshot_moref: &str,
    disk_key: i32,
    start_offset: u64,
    change_id: &str,
) -> String {
    format!(
        r#"<vim25:QueryChangedDiskAreas><_this type="VirtualMachine">{vm_moref}</_this><snapshot type="VirtualMachineSnapshot">{snapshot_moref}</snapshot><deviceKey>{disk_key}</deviceKey><startOffset>{start_offset}</startOffset><changeId>{}</changeId></vim25:QueryChangedDiskAreas>"#,
        xml_escape(change_id)
    )
}

pub fn parse_changed_areas(body: &str) -> Result<(Vec<ChangedArea>, u64), SoapError> {
    let starts = extract_all_tags(body, "start");
    let lengths = extract_all_tags(body, "length");
    let next_offset = extract_tag(body, "startOffset")
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX);

    let areas = starts
        .into_iter()
        .zip(lengths)
        .filter_map(|(s, l)| Some(ChangedArea {
            start: s.parse().ok()?,
            length: l.parse().ok()?,
        }))
        .collect();

    Ok((areas, next_offset))
}

pub fn build_retrieve_task_info(task_moref: &str) -> String {
    format!(
        r#"<vim25:RetrieveProperties><_this type="PropertyCollector">propertyCollector</_this><specSet><propSet><type>Task</type><pathSet>info.state</pathSet><pathSet>info.result</pathSet><pathSet>info.error</pathSet></propSet><objectSet><obj type="Task">{task_moref}</obj></objectSet></specSet></vim25:RetrieveProperties>"#
    )
}

/// Flattened `info.*` fields of a vCenter `Task`.
pub struct TaskInfo {
    pub state: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

pub fn parse_task_info(body: &str) -> Result<TaskInfo, SoapError> {
    let state = extract_tag(body, "state")
        .ok_or_else(|| SoapError::Malformed("task response missing state".to_owned()))?;
    Ok(TaskInfo {
        state,
        result: extract_tag(body, "result"),
        error: extract_tag(body, "faultstring"),
    })
}

pub fn parse_task_moref(body: &str) -> Result<String, SoapError> {
    extract_tag(body, "returnval")
        .ok_or_else(|| SoapError::Malformed("task call missing returnval".to_owned()))
}

/// Extracts the text content of the first `<tag>...</tag>` occurrence.
/// Sufficient for the narrow, known-shape responses this client parses;
/// not a general XPath engine.
fn extract_tag(body: &str, tag: &str) -> Option<String> {
    extract_all_tags(body, tag).into_iter().next()
}

fn extract_all_tags(body: &str, tag: &str) -> Vec<String> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut out = Vec::new();
    let mut buf = Vec::new();
    let mut capturing = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(t)) if local_name_matches(t.name().as_ref(), tag) => {
                capturing = true;
            }
            Ok(Event::Text(text)) if capturing => {
                out.push(text.unescape().unwrap_or_default().into_owned());
                capturing = false;
            }
            Ok(Event::End(t)) if local_name_matches(t.name().as_ref(), tag) => {
                capturing = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}

/// Matches an XML element's local name, ignoring any namespace prefix
/// (vCenter responses are typically unprefixed, but be tolerant).
fn local_name_matches(qname: &[u8], local: &str) -> bool {
    let s = String::from_utf8_lossy(qname);
    s == local || s.rsplit(':').next() == Some(local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_tag() {
        let xml = "<root><returnval>vm-123</returnval></root>";
        assert_eq!(extract_tag(xml, "returnval").as_deref(), Some("vm-123"));
    }

    #[test]
    fn extracts_repeated_tags_in_order() {
        let xml = "<root><name>a</name><name>b</name></root>";
        assert_eq!(extract_all_tags(xml, "name"), vec!["a", "b"]);
    }

    #[test]
    fn login_response_requires_element() {
        assert!(parse_login_response("<Envelope><Body><LoginResponse/></Body></Envelope>").is_ok());
        assert!(parse_login_response("<Envelope><Body/></Envelope>").is_err());
    }

    #[test]
    fn backing_info_defaults_to_flat_v2_when_type_unrecognized() {
        let body = r#"<root><VirtualDisk><key>2000</key><backing><changeId>52 1a*2</changeId></backing></VirtualDisk></root>"#;
        let backing = parse_backing_info(body, 2000).unwrap();
        assert!(matches!(backing, BackingInfo::FlatV2 { .. }));
        assert_eq!(backing.change_id().as_deref(), Some("52 1a*2"));
    }

    #[test]
    fn backing_info_detects_sparse_v2_from_xsi_type() {
        let body = r#"<root><VirtualDisk><key>2001</key><backing xsi:type="VirtualDiskSparseVer2BackingInfo"><changeId>aa</changeId></backing></VirtualDisk></root>"#;
        let backing = parse_backing_info(body, 2001).unwrap();
        assert!(matches!(backing, BackingInfo::SparseV2 { .. }));
    }

    #[test]
    fn backing_info_filters_by_disk_key_in_multi_disk_response() {
        let body = r#"<root>
            <VirtualDisk><key>2000</key><backing><changeId>change-for-2000</changeId></backing></VirtualDisk>
            <VirtualDisk><key>2001</key><backing><changeId>change-for-2001</changeId></backing></VirtualDisk>
        </root>"#;
        let backing = parse_backing_info(body, 2001).unwrap();
        assert_eq!(backing.change_id().as_deref(), Some("change-for-2001"));
    }

    #[test]
    fn datastore_parsed_from_file_name_bracket_prefix() {
        assert_eq!(
            datastore_from_file_name("[datastore1] web-01/web-01.vmdk"),
            Some("datastore1".to_owned())
        );
        assert_eq!(datastore_from_file_name("no-brackets.vmdk"), None);
    }

    #[test]
    fn changed_areas_pair_start_and_length() {
        let body = "<root><start>0</start><length>65536</length><start>131072</start><length>4096</length><startOffset>200000</startOffset></root>";
        let (areas, next) = parse_changed_areas(body).unwrap();
        assert_eq!(areas.len(), 2);
        assert_eq!(areas[0].start, 0);
        assert_eq!(areas[1].length, 4096);
        assert_eq!(next, 200_000);
    }
}
