//! Form definitions a question type exposes to the host for editing its
//! options. The element set is a closed, serde-tagged union; hosts render it
//! however they see fit.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticTextElement {
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextInputElement {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckboxElement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_label: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckboxGroupElement {
    pub name: String,
    pub checkboxes: Vec<CheckboxElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
    #[serde(default)]
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioGroupElement {
    pub name: String,
    pub label: String,
    pub options: Vec<SelectOption>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectElement {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub multiple: bool,
    pub options: Vec<SelectOption>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenElement {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupElement {
    pub name: String,
    pub label: String,
    pub elements: Vec<FormElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormElement {
    StaticText(StaticTextElement),
    Input(TextInputElement),
    Checkbox(CheckboxElement),
    CheckboxGroup(CheckboxGroupElement),
    RadioGroup(RadioGroupElement),
    Select(SelectElement),
    Hidden(HiddenElement),
    Group(GroupElement),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSection {
    pub header: String,
    #[serde(default)]
    pub elements: Vec<FormElement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionsFormDefinition {
    #[serde(default)]
    pub general: Vec<FormElement>,
    #[serde(default)]
    pub sections: Vec<FormSection>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn elements_tag_by_kind() {
        let definition = OptionsFormDefinition {
            general: vec![
                FormElement::Input(TextInputElement {
                    name: "prompt".to_string(),
                    label: "Prompt".to_string(),
                    required: true,
                    default: None,
                    placeholder: None,
                }),
                FormElement::Hidden(HiddenElement {
                    name: "revision".to_string(),
                    value: "2".to_string(),
                }),
            ],
            sections: Vec::new(),
        };

        let json = serde_json::to_value(&definition).expect("serialize");
        assert_eq!(json["general"][0]["kind"], "input");
        assert_eq!(json["general"][1]["kind"], "hidden");

        let parsed: OptionsFormDefinition = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, definition);
    }
}
