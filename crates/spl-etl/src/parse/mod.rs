//! Streaming SPL document parser.
//!
//! One forward-only pass over the XML event stream: each element's storage
//! is released when its close event is consumed, so peak memory does not
//! scale with document size; the working set is the open-element stack,
//! the per-scope builders, and the canonical payload being emitted.
//!
//! The HL7 namespace is recognized by URI; prefixes in the source are not
//! stable and are never matched textually.

pub mod payload;

use std::collections::HashSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use uuid::Uuid;

use spl_common::{EtlError, Result};

use crate::model::{
    clean_string, parse_spl_date, Ingredient, MarketingStatus, Packaging, ParsedDocument,
};
use payload::PayloadBuilder;

/// HL7 v3 namespace URI
pub const HL7_NAMESPACE: &str = "urn:hl7-org:v3";

/// Code system OID for National Drug Codes
pub const NDC_CODE_SYSTEM: &str = "2.16.840.1.113883.6.69";

/// `ingredient/@classCode` values that mark an active ingredient
const ACTIVE_INGREDIENT_CLASSES: [&str; 3] = ["ACTIB", "ACTIM", "ACTIR"];

/// Parse one SPL XML file into a [`ParsedDocument`].
///
/// `source_filename` is the archive-relative path recorded in
/// `spl_raw_documents`.
pub fn parse_file(path: &Path, source_filename: &str) -> Result<ParsedDocument> {
    let file = std::fs::File::open(path)?;
    let reader = NsReader::from_reader(std::io::BufReader::new(file));
    parse_with_reader(reader, path, source_filename)
}

/// Parse an in-memory SPL document (tests, round-trip checks)
pub fn parse_str(xml: &str, source_filename: &str) -> Result<ParsedDocument> {
    parse_with_reader(
        NsReader::from_str(xml),
        Path::new(source_filename),
        source_filename,
    )
}

fn parse_with_reader<R: BufRead>(
    mut reader: NsReader<R>,
    path: &Path,
    source_filename: &str,
) -> Result<ParsedDocument> {
    reader.config_mut().trim_text(true);

    let mut extractor = DocumentExtractor::new(path);
    let mut builder = PayloadBuilder::new();
    let mut buf = Vec::new();
    let mut saw_root = false;

    loop {
        buf.clear();
        let position = reader.buffer_position();
        let (resolve, event) = reader.read_resolved_event_into(&mut buf).map_err(|e| {
            EtlError::malformed(path, format!("XML syntax error near byte {position}: {e}"))
        })?;
        match event {
            Event::Start(ref e) => {
                let el = ElementParts::read(&resolve, e, path)?;
                extractor.on_start(&el)?;
                builder.start_element(&el.local, el.ns.as_deref(), &el.attrs);
                saw_root = true;
            }
            Event::Empty(ref e) => {
                let el = ElementParts::read(&resolve, e, path)?;
                extractor.on_start(&el)?;
                extractor.on_end();
                builder.empty_element(&el.local, el.ns.as_deref(), &el.attrs);
                saw_root = true;
            }
            Event::End(_) => {
                extractor.on_end();
                builder.end_element();
            }
            Event::Text(ref t) => {
                let text = t.unescape().map_err(|e| {
                    EtlError::malformed(path, format!("invalid character data: {e}"))
                })?;
                extractor.on_text(&text);
                builder.text(&text);
            }
            Event::CData(ref t) => {
                let text = String::from_utf8_lossy(t);
                extractor.on_text(&text);
                builder.text(&text);
            }
            Event::Eof => break,
            // Declarations, comments, and processing instructions carry no
            // label content.
            _ => {}
        }
    }

    if !saw_root {
        return Err(EtlError::malformed(path, "no root element found"));
    }
    extractor.finish(builder.finish(), source_filename)
}

/// Decoded pieces of a start/empty element event
struct ElementParts {
    local: String,
    /// Resolved namespace URI of the element, if bound
    ns: Option<String>,
    /// True when the element is in the HL7 namespace
    hl7: bool,
    /// Attributes with their source-qualified names, in document order
    attrs: Vec<(String, String)>,
}

impl ElementParts {
    fn read(resolve: &ResolveResult<'_>, event: &BytesStart<'_>, path: &Path) -> Result<Self> {
        let local = String::from_utf8_lossy(event.local_name().as_ref()).into_owned();
        let ns = match resolve {
            ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.0).into_owned()),
            _ => None,
        };
        let hl7 = ns.as_deref() == Some(HL7_NAMESPACE);

        let mut attrs = Vec::new();
        for attr in event.attributes() {
            let attr = attr.map_err(|e| {
                EtlError::malformed(path, format!("malformed attribute in <{local}>: {e}"))
            })?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| {
                    EtlError::malformed(path, format!("invalid attribute value in <{local}>: {e}"))
                })?
                .into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            local,
            ns,
            hl7,
            attrs,
        })
    }

    /// Attribute lookup by local name (prefixes ignored, xmlns skipped)
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find_map(|(key, value)| {
            if key == "xmlns" || key.starts_with("xmlns:") {
                return None;
            }
            let local = key.rsplit(':').next().unwrap_or(key.as_str());
            (local == name).then_some(value.as_str())
        })
    }
}

/// Element the active text capture feeds into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextTarget {
    ProductName,
    ManufacturerName,
    IngredientName,
    PackageDescription,
}

struct Capture {
    target: TextTarget,
    /// Stack depth of the element whose text is being captured
    depth: usize,
    buffer: String,
}

/// One open element on the path stack
struct PathFrame {
    local: String,
    hl7: bool,
}

/// Field extraction state machine driven by resolved XML events.
///
/// Extraction paths (per the HL7 SPL structure, see the implementation
/// guide):
/// - `document/id/@root`, `document/setId/@root`,
///   `document/versionNumber/@value`, `document/effectiveTime/@value`
/// - `manufacturedProduct/name` (first), `manufacturedProduct/formCode/@displayName`
/// - `representedOrganization/name` (first)
/// - `consumedIn/substanceAdministration/routeCode/@displayName` (first)
/// - `code/@code` wherever `@codeSystem` is the NDC OID, distinct,
///   first-seen order
/// - `ingredient` with `ingredientSubstance/{name,code}` and
///   `quantity/{numerator,denominator}`
/// - nested `containerPackagedProduct` flattened depth-first
/// - `marketingAct/statusCode/@code` with `effectiveTime/{low,high}/@value`
struct DocumentExtractor {
    source_path: PathBuf,
    path: Vec<PathFrame>,

    document_id: Option<String>,
    set_id: Option<String>,
    version_number: Option<String>,
    effective_time: Option<String>,
    product_name: Option<String>,
    manufacturer_name: Option<String>,
    dosage_form: Option<String>,
    route_of_administration: Option<String>,

    ndcs: Vec<String>,
    ndc_seen: HashSet<String>,

    ingredient_stack: Vec<Ingredient>,
    ingredients: Vec<Ingredient>,

    /// Indexes into `packaging` for the currently open containers;
    /// rows are reserved at open so the flattened output stays depth-first.
    container_stack: Vec<usize>,
    packaging: Vec<Packaging>,

    marketing_current: Option<MarketingStatus>,
    marketing: Vec<MarketingStatus>,

    capture: Option<Capture>,
}

impl DocumentExtractor {
    fn new(path: &Path) -> Self {
        Self {
            source_path: path.to_path_buf(),
            path: Vec::new(),
            document_id: None,
            set_id: None,
            version_number: None,
            effective_time: None,
            product_name: None,
            manufacturer_name: None,
            dosage_form: None,
            route_of_administration: None,
            ndcs: Vec::new(),
            ndc_seen: HashSet::new(),
            ingredient_stack: Vec::new(),
            ingredients: Vec::new(),
            container_stack: Vec::new(),
            packaging: Vec::new(),
            marketing_current: None,
            marketing: Vec::new(),
            capture: None,
        }
    }

    fn parent_is(&self, name: &str) -> bool {
        self.path
            .last()
            .map(|frame| frame.hl7 && frame.local == name)
            .unwrap_or(false)
    }

    fn path_ends_with(&self, suffix: &[&str]) -> bool {
        if self.path.len() < suffix.len() {
            return false;
        }
        self.path
            .iter()
            .rev()
            .zip(suffix.iter().rev())
            .all(|(frame, name)| frame.hl7 && frame.local == *name)
    }

    fn begin_capture(&mut self, target: TextTarget) {
        self.capture = Some(Capture {
            target,
            depth: self.path.len() + 1,
            buffer: String::new(),
        });
    }

    fn current_container(&mut self) -> Option<&mut Packaging> {
        let slot = *self.container_stack.last()?;
        self.packaging.get_mut(slot)
    }

    fn on_start(&mut self, el: &ElementParts) -> Result<()> {
        if self.path.is_empty() && !(el.hl7 && el.local == "document") {
            return Err(EtlError::malformed(
                &self.source_path,
                format!(
                    "root element <{}> is not an HL7 <document> (namespace {HL7_NAMESPACE})",
                    el.local
                ),
            ));
        }

        if el.hl7 {
            self.extract(el);
        }

        self.path.push(PathFrame {
            local: el.local.clone(),
            hl7: el.hl7,
        });
        Ok(())
    }

    fn extract(&mut self, el: &ElementParts) {
        let at_document_root = self.path.len() == 1 && self.path_ends_with(&["document"]);

        match el.local.as_str() {
            "id" if at_document_root => {
                if self.document_id.is_none() {
                    self.document_id = el.attr("root").and_then(clean_string);
                }
            }
            "setId" if at_document_root => {
                if self.set_id.is_none() {
                    self.set_id = el.attr("root").and_then(clean_string);
                }
            }
            "versionNumber" if at_document_root => {
                if self.version_number.is_none() {
                    self.version_number = el.attr("value").and_then(clean_string);
                }
            }
            "effectiveTime" if at_document_root => {
                if self.effective_time.is_none() {
                    self.effective_time = el.attr("value").and_then(clean_string);
                }
            }
            "name" => {
                if self.parent_is("manufacturedProduct") && self.product_name.is_none() {
                    self.begin_capture(TextTarget::ProductName);
                } else if self.parent_is("representedOrganization")
                    && self.manufacturer_name.is_none()
                {
                    self.begin_capture(TextTarget::ManufacturerName);
                } else if self.parent_is("ingredientSubstance")
                    && !self.ingredient_stack.is_empty()
                {
                    self.begin_capture(TextTarget::IngredientName);
                } else if self.parent_is("containerPackagedProduct")
                    && !self.container_stack.is_empty()
                {
                    self.begin_capture(TextTarget::PackageDescription);
                }
            }
            "desc" => {
                if self.parent_is("containerPackagedProduct") && !self.container_stack.is_empty() {
                    self.begin_capture(TextTarget::PackageDescription);
                }
            }
            "formCode" => {
                if self.parent_is("manufacturedProduct") && self.dosage_form.is_none() {
                    self.dosage_form = el.attr("displayName").and_then(clean_string);
                } else if self.parent_is("containerPackagedProduct") {
                    let package_type = el.attr("displayName").and_then(clean_string);
                    if let Some(container) = self.current_container() {
                        if container.package_type.is_none() {
                            container.package_type = package_type;
                        }
                    }
                }
            }
            "routeCode" => {
                // First distinct route wins when a label names several.
                if self.path_ends_with(&["consumedIn", "substanceAdministration"])
                    && self.route_of_administration.is_none()
                {
                    self.route_of_administration =
                        el.attr("displayName").and_then(clean_string);
                }
            }
            "code" => {
                if el.attr("codeSystem") == Some(NDC_CODE_SYSTEM) {
                    if let Some(ndc) = el.attr("code").and_then(clean_string) {
                        if self.ndc_seen.insert(ndc.clone()) {
                            self.ndcs.push(ndc);
                        }
                    }
                }
                if self.parent_is("ingredientSubstance") {
                    if let Some(ingredient) = self.ingredient_stack.last_mut() {
                        if ingredient.substance_code.is_none() {
                            ingredient.substance_code = el.attr("code").and_then(clean_string);
                        }
                    }
                } else if self.parent_is("containerPackagedProduct") {
                    let package_ndc = el.attr("code").and_then(clean_string);
                    if let Some(container) = self.current_container() {
                        if container.package_ndc.is_none() {
                            container.package_ndc = package_ndc;
                        }
                    }
                }
            }
            "ingredient" => {
                let is_active = el
                    .attr("classCode")
                    .map(|class| ACTIVE_INGREDIENT_CLASSES.contains(&class.trim()))
                    .unwrap_or(false);
                self.ingredient_stack.push(Ingredient {
                    is_active,
                    ..Ingredient::default()
                });
            }
            "numerator" => {
                if self.path_ends_with(&["ingredient", "quantity"]) {
                    if let Some(ingredient) = self.ingredient_stack.last_mut() {
                        ingredient.strength_numerator = el.attr("value").and_then(clean_string);
                        ingredient.unit_of_measure = el.attr("unit").and_then(clean_string);
                    }
                }
            }
            "denominator" => {
                if self.path_ends_with(&["ingredient", "quantity"]) {
                    if let Some(ingredient) = self.ingredient_stack.last_mut() {
                        ingredient.strength_denominator = el.attr("value").and_then(clean_string);
                    }
                }
            }
            "containerPackagedProduct" => {
                // Reserve the output slot now: nested containers close before
                // their parents, but the flattened rows stay depth-first.
                let slot = self.packaging.len();
                self.packaging.push(Packaging::default());
                self.container_stack.push(slot);
            }
            "marketingAct" => {
                self.marketing_current = Some(MarketingStatus::default());
            }
            "statusCode" => {
                if self.parent_is("marketingAct") {
                    if let Some(act) = self.marketing_current.as_mut() {
                        if act.marketing_category.is_none() {
                            act.marketing_category = el.attr("code").and_then(clean_string);
                        }
                    }
                }
            }
            "low" => {
                if self.path_ends_with(&["marketingAct", "effectiveTime"]) {
                    if let Some(act) = self.marketing_current.as_mut() {
                        act.start_date = el.attr("value").and_then(|v| parse_spl_date(v));
                    }
                }
            }
            "high" => {
                if self.path_ends_with(&["marketingAct", "effectiveTime"]) {
                    if let Some(act) = self.marketing_current.as_mut() {
                        act.end_date = el.attr("value").and_then(|v| parse_spl_date(v));
                    }
                }
            }
            _ => {}
        }
    }

    fn on_text(&mut self, text: &str) {
        if let Some(capture) = self.capture.as_mut() {
            if capture.depth == self.path.len() {
                capture.buffer.push_str(text);
            }
        }
    }

    fn on_end(&mut self) {
        let Some(frame) = self.path.pop() else {
            return;
        };

        let capture_done = self
            .capture
            .as_ref()
            .is_some_and(|c| c.depth == self.path.len() + 1);
        if capture_done {
            if let Some(capture) = self.capture.take() {
                self.finish_capture(capture);
            }
        }

        if !frame.hl7 {
            return;
        }
        match frame.local.as_str() {
            "ingredient" => {
                if let Some(ingredient) = self.ingredient_stack.pop() {
                    self.ingredients.push(ingredient);
                }
            }
            "containerPackagedProduct" => {
                self.container_stack.pop();
            }
            "marketingAct" => {
                if let Some(act) = self.marketing_current.take() {
                    self.marketing.push(act);
                }
            }
            _ => {}
        }
    }

    fn finish_capture(&mut self, capture: Capture) {
        let value = clean_string(&capture.buffer);
        if value.is_none() {
            return;
        }
        match capture.target {
            TextTarget::ProductName => {
                if self.product_name.is_none() {
                    self.product_name = value;
                }
            }
            TextTarget::ManufacturerName => {
                if self.manufacturer_name.is_none() {
                    self.manufacturer_name = value;
                }
            }
            TextTarget::IngredientName => {
                if let Some(ingredient) = self.ingredient_stack.last_mut() {
                    if ingredient.name.is_none() {
                        ingredient.name = value;
                    }
                }
            }
            TextTarget::PackageDescription => {
                if let Some(container) = self.current_container() {
                    if container.package_description.is_none() {
                        container.package_description = value;
                    }
                }
            }
        }
    }

    fn finish(self, raw_payload: serde_json::Value, source_filename: &str) -> Result<ParsedDocument> {
        let path = &self.source_path;

        let document_id = require_uuid(self.document_id.as_deref(), "<id root=...>", path)?;
        let set_id = require_uuid(self.set_id.as_deref(), "<setId root=...>", path)?;

        let version_raw = self.version_number.as_deref().ok_or_else(|| {
            EtlError::malformed(path, "missing required <versionNumber value=...>")
        })?;
        let version_number: i32 = version_raw.parse().map_err(|_| {
            EtlError::malformed(path, format!("invalid versionNumber '{version_raw}'"))
        })?;
        if version_number <= 0 {
            return Err(EtlError::malformed(
                path,
                format!("versionNumber must be positive, got {version_number}"),
            ));
        }

        let effective_raw = self.effective_time.as_deref().ok_or_else(|| {
            EtlError::malformed(path, "missing required <effectiveTime value=...>")
        })?;
        let effective_time = parse_spl_date(effective_raw).ok_or_else(|| {
            EtlError::malformed(path, format!("invalid effectiveTime '{effective_raw}'"))
        })?;

        Ok(ParsedDocument {
            document_id,
            set_id,
            version_number,
            effective_time,
            product_name: self.product_name,
            manufacturer_name: self.manufacturer_name,
            dosage_form: self.dosage_form,
            route_of_administration: self.route_of_administration,
            ndcs: self.ndcs,
            ingredients: self.ingredients,
            packaging: self.packaging,
            marketing_status: self.marketing,
            raw_payload,
            source_filename: source_filename.to_string(),
        })
    }
}

fn require_uuid(value: Option<&str>, what: &str, path: &Path) -> Result<Uuid> {
    let raw = value
        .ok_or_else(|| EtlError::malformed(path, format!("missing required {what}")))?;
    Uuid::parse_str(raw)
        .map_err(|_| EtlError::malformed(path, format!("{what} is not a valid UUID: '{raw}'")))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const DOC_ID: &str = "a7f1b9c3-2e44-4f0a-9d36-5b8e2c7d1a90";
    const SET_ID: &str = "0f6c2d84-911b-4e6a-8c25-3d7a1e9b4f52";

    fn sample_label() -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<document xmlns="urn:hl7-org:v3">
  <id root="{DOC_ID}"/>
  <setId root="{SET_ID}"/>
  <versionNumber value="2"/>
  <effectiveTime value="20240115"/>
  <author>
    <assignedEntity>
      <representedOrganization>
        <name>  Acme Pharmaceuticals  </name>
      </representedOrganization>
    </assignedEntity>
  </author>
  <component>
    <structuredBody>
      <component>
        <section>
          <subject>
            <manufacturedProduct>
              <manufacturedProduct>
                <name>Paracetamol 500 mg Tablets</name>
                <formCode code="C42998" displayName="TABLET"/>
                <asEquivalentEntity>
                  <code code="0002-1433" codeSystem="2.16.840.1.113883.6.69"/>
                </asEquivalentEntity>
                <ingredient classCode="ACTIB">
                  <quantity>
                    <numerator value="500" unit="mg"/>
                    <denominator value="1" unit="1"/>
                  </quantity>
                  <ingredientSubstance>
                    <code code="362O9ITL9D" codeSystem="2.16.840.1.113883.4.9"/>
                    <name>ACETAMINOPHEN</name>
                  </ingredientSubstance>
                </ingredient>
                <ingredient classCode="IACT">
                  <ingredientSubstance>
                    <code code="O8232NY3SJ" codeSystem="2.16.840.1.113883.4.9"/>
                    <name>STARCH, CORN</name>
                  </ingredientSubstance>
                </ingredient>
                <asContent>
                  <containerPackagedProduct>
                    <code code="0002-1433-80" codeSystem="2.16.840.1.113883.6.69"/>
                    <name>Bottle of 100</name>
                    <formCode code="C43169" displayName="BOTTLE"/>
                    <asContent>
                      <containerPackagedProduct>
                        <code code="0002-1433-61" codeSystem="2.16.840.1.113883.6.69"/>
                        <formCode code="C43182" displayName="CARTON"/>
                      </containerPackagedProduct>
                    </asContent>
                  </containerPackagedProduct>
                </asContent>
                <consumedIn>
                  <substanceAdministration>
                    <routeCode code="C38288" displayName="ORAL"/>
                  </substanceAdministration>
                </consumedIn>
              </manufacturedProduct>
            </manufacturedProduct>
          </subject>
          <subject>
            <marketingAct>
              <code code="C53292" codeSystem="2.16.840.1.113883.3.26.1.1"/>
              <statusCode code="active"/>
              <effectiveTime>
                <low value="20200301"/>
                <high value="20251231"/>
              </effectiveTime>
            </marketingAct>
          </subject>
        </section>
      </component>
    </structuredBody>
  </component>
</document>"#
        )
    }

    #[test]
    fn test_parse_extracts_document_metadata() {
        let doc = parse_str(&sample_label(), "label.xml").unwrap();
        assert_eq!(doc.document_id, Uuid::parse_str(DOC_ID).unwrap());
        assert_eq!(doc.set_id, Uuid::parse_str(SET_ID).unwrap());
        assert_eq!(doc.version_number, 2);
        assert_eq!(
            doc.effective_time,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
        assert_eq!(doc.source_filename, "label.xml");
    }

    #[test]
    fn test_parse_extracts_product_fields() {
        let doc = parse_str(&sample_label(), "label.xml").unwrap();
        assert_eq!(
            doc.product_name.as_deref(),
            Some("Paracetamol 500 mg Tablets")
        );
        assert_eq!(
            doc.manufacturer_name.as_deref(),
            Some("Acme Pharmaceuticals")
        );
        assert_eq!(doc.dosage_form.as_deref(), Some("TABLET"));
        assert_eq!(doc.route_of_administration.as_deref(), Some("ORAL"));
    }

    #[test]
    fn test_parse_collects_distinct_ndcs_in_order() {
        let doc = parse_str(&sample_label(), "label.xml").unwrap();
        assert_eq!(doc.ndcs, vec!["0002-1433", "0002-1433-80", "0002-1433-61"]);
    }

    #[test]
    fn test_parse_ingredients_and_activity() {
        let doc = parse_str(&sample_label(), "label.xml").unwrap();
        assert_eq!(doc.ingredients.len(), 2);

        let active = &doc.ingredients[0];
        assert_eq!(active.name.as_deref(), Some("ACETAMINOPHEN"));
        assert_eq!(active.substance_code.as_deref(), Some("362O9ITL9D"));
        assert_eq!(active.strength_numerator.as_deref(), Some("500"));
        assert_eq!(active.strength_denominator.as_deref(), Some("1"));
        assert_eq!(active.unit_of_measure.as_deref(), Some("mg"));
        assert!(active.is_active);

        let inactive = &doc.ingredients[1];
        assert_eq!(inactive.name.as_deref(), Some("STARCH, CORN"));
        assert!(!inactive.is_active);
    }

    #[test]
    fn test_parse_flattens_packaging_depth_first() {
        let doc = parse_str(&sample_label(), "label.xml").unwrap();
        assert_eq!(doc.packaging.len(), 2);
        assert_eq!(doc.packaging[0].package_ndc.as_deref(), Some("0002-1433-80"));
        assert_eq!(
            doc.packaging[0].package_description.as_deref(),
            Some("Bottle of 100")
        );
        assert_eq!(doc.packaging[0].package_type.as_deref(), Some("BOTTLE"));
        assert_eq!(doc.packaging[1].package_ndc.as_deref(), Some("0002-1433-61"));
        assert_eq!(doc.packaging[1].package_type.as_deref(), Some("CARTON"));
    }

    #[test]
    fn test_parse_marketing_status() {
        let doc = parse_str(&sample_label(), "label.xml").unwrap();
        assert_eq!(doc.marketing_status.len(), 1);
        let act = &doc.marketing_status[0];
        assert_eq!(act.marketing_category.as_deref(), Some("active"));
        assert_eq!(
            act.start_date,
            Some(NaiveDate::from_ymd_opt(2020, 3, 1).unwrap())
        );
        assert_eq!(
            act.end_date,
            Some(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap())
        );
    }

    #[test]
    fn test_parse_accepts_prefixed_namespace() {
        let xml = format!(
            r#"<v3:document xmlns:v3="urn:hl7-org:v3">
  <v3:id root="{DOC_ID}"/>
  <v3:setId root="{SET_ID}"/>
  <v3:versionNumber value="7"/>
  <v3:effectiveTime value="202403"/>
</v3:document>"#
        );
        let doc = parse_str(&xml, "prefixed.xml").unwrap();
        assert_eq!(doc.version_number, 7);
        // YYYYMM is read as the first of the month
        assert_eq!(
            doc.effective_time,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }

    #[test]
    fn test_parse_rejects_wrong_root_namespace() {
        let xml = format!(
            r#"<document xmlns="urn:example:other">
  <id root="{DOC_ID}"/>
  <setId root="{SET_ID}"/>
  <versionNumber value="1"/>
  <effectiveTime value="2024"/>
</document>"#
        );
        let err = parse_str(&xml, "other.xml").unwrap_err();
        assert!(matches!(err, EtlError::MalformedDocument { .. }));
    }

    #[test]
    fn test_parse_rejects_missing_set_id() {
        let xml = format!(
            r#"<document xmlns="urn:hl7-org:v3">
  <id root="{DOC_ID}"/>
  <versionNumber value="1"/>
  <effectiveTime value="20240101"/>
</document>"#
        );
        let err = parse_str(&xml, "noset.xml").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("setId"), "unexpected message: {msg}");
    }

    #[test]
    fn test_parse_rejects_non_positive_version() {
        let xml = format!(
            r#"<document xmlns="urn:hl7-org:v3">
  <id root="{DOC_ID}"/>
  <setId root="{SET_ID}"/>
  <versionNumber value="0"/>
  <effectiveTime value="20240101"/>
</document>"#
        );
        let err = parse_str(&xml, "v0.xml").unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_parse_rejects_truncated_xml() {
        let xml = r#"<document xmlns="urn:hl7-org:v3"><id root="abc"#;
        let err = parse_str(xml, "truncated.xml").unwrap_err();
        assert!(matches!(err, EtlError::MalformedDocument { .. }));
    }

    #[test]
    fn test_parse_uuid_is_case_normalized() {
        let xml = format!(
            r#"<document xmlns="urn:hl7-org:v3">
  <id root="{upper}"/>
  <setId root="{SET_ID}"/>
  <versionNumber value="1"/>
  <effectiveTime value="20240101"/>
</document>"#,
            upper = DOC_ID.to_uppercase()
        );
        let doc = parse_str(&xml, "upper.xml").unwrap();
        assert_eq!(doc.document_id.to_string(), DOC_ID);
    }

    #[test]
    fn test_payload_round_trip() {
        let doc = parse_str(&sample_label(), "label.xml").unwrap();
        let xml = payload::to_xml(&doc.raw_payload);
        let doc2 = parse_str(&xml, "label.xml").unwrap();
        assert_eq!(doc, doc2);
    }

    #[test]
    fn test_parse_many_siblings_streams() {
        // A document with a long flat body; the parser should only ever hold
        // the open-element path, not the siblings already consumed.
        let mut body = String::new();
        for i in 0..5_000 {
            body.push_str(&format!(
                "<observationMedia ID=\"img{i}\"><text>frame {i}</text></observationMedia>"
            ));
        }
        let xml = format!(
            r#"<document xmlns="urn:hl7-org:v3">
  <id root="{DOC_ID}"/>
  <setId root="{SET_ID}"/>
  <versionNumber value="3"/>
  <effectiveTime value="20240101"/>
  <component>{body}</component>
</document>"#
        );
        let doc = parse_str(&xml, "wide.xml").unwrap();
        assert_eq!(doc.version_number, 3);
        let children = doc.raw_payload["children"].as_array().unwrap();
        let component = children.last().unwrap();
        assert_eq!(component["children"].as_array().unwrap().len(), 5_000);
    }
}
