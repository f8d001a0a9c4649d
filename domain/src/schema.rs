//! Declarative field schemas for the three record kinds.
//!
//! Each schema lists every field a request for that entity may carry: how it
//! parses, whether an add request must supply it, and what part it plays in
//! searches. The validator and the set of recognized find filters are both
//! derived from these tables.

/// How the raw text of a field is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    /// Any finite number.
    Number,
    /// A finite number without a fractional part.
    Integer,
}

/// The part a field plays in records and searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Stored on the record and usable as an equality filter.
    Attribute,
    /// Stored on the record but not accepted as a filter.
    Stored,
    /// Lower end of the entity's min/max pair (also an equality filter).
    RangeMin,
    /// Upper end of the entity's min/max pair (also an equality filter).
    RangeMax,
    /// Search-only inclusive lower bound on the named record field.
    LowerBound(&'static str),
    /// Search-only inclusive upper bound on the named record field.
    UpperBound(&'static str),
}

/// Defines a single field of an entity schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: &'static str,
    pub field_type: FieldType,
    pub role: FieldRole,
    /// Must an add request supply this field?
    pub required: bool,
    /// Numeric value must be strictly positive.
    pub positive: bool,
}

impl FieldDefinition {
    const fn new(name: &'static str, field_type: FieldType, role: FieldRole) -> Self {
        let required = !matches!(role, FieldRole::LowerBound(_) | FieldRole::UpperBound(_));
        Self {
            name,
            field_type,
            role,
            required,
            positive: false,
        }
    }

    const fn text(name: &'static str) -> Self {
        Self::new(name, FieldType::Text, FieldRole::Attribute)
    }

    const fn number(name: &'static str, role: FieldRole) -> Self {
        Self::new(name, FieldType::Number, role)
    }

    const fn must_be_positive(self) -> Self {
        Self {
            positive: true,
            ..self
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self.field_type, FieldType::Text)
    }

    /// Fields that are part of a stored record (as opposed to search-only bounds).
    pub fn is_record_field(&self) -> bool {
        !matches!(self.role, FieldRole::LowerBound(_) | FieldRole::UpperBound(_))
    }

    /// Fields a find command accepts.
    pub fn is_filter(&self) -> bool {
        !matches!(self.role, FieldRole::Stored)
    }
}

/// The schema of one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySchema {
    pub name: &'static str,
    pub fields: &'static [FieldDefinition],
}

impl EntitySchema {
    pub fn field(&self, name: &str) -> Option<&'static FieldDefinition> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn record_fields(&self) -> impl Iterator<Item = &'static FieldDefinition> {
        self.fields.iter().filter(|field| field.is_record_field())
    }

    pub fn filter_fields(&self) -> impl Iterator<Item = &'static FieldDefinition> {
        self.fields.iter().filter(|field| field.is_filter())
    }

    /// The (min, max) field pair constrained to `min < max`, if the entity has one.
    pub fn range_pair(&self) -> Option<(&'static FieldDefinition, &'static FieldDefinition)> {
        let min = self.fields.iter().find(|f| f.role == FieldRole::RangeMin)?;
        let max = self.fields.iter().find(|f| f.role == FieldRole::RangeMax)?;
        Some((min, max))
    }
}

pub static SENSOR_TYPE_SCHEMA: EntitySchema = EntitySchema {
    name: "sensor-type",
    fields: &[
        FieldDefinition::text("id"),
        FieldDefinition::text("manufacturer"),
        FieldDefinition::text("modelNumber"),
        FieldDefinition::text("quantity"),
        FieldDefinition::text("unit"),
        FieldDefinition::number("min", FieldRole::RangeMin),
        FieldDefinition::number("max", FieldRole::RangeMax),
    ],
};

pub static SENSOR_SCHEMA: EntitySchema = EntitySchema {
    name: "sensor",
    fields: &[
        FieldDefinition::text("id"),
        FieldDefinition::text("sensorTypeId"),
        FieldDefinition::number("period", FieldRole::Attribute).must_be_positive(),
        FieldDefinition::number("min", FieldRole::RangeMin),
        FieldDefinition::number("max", FieldRole::RangeMax),
    ],
};

pub static SENSOR_READING_SCHEMA: EntitySchema = EntitySchema {
    name: "sensor reading",
    fields: &[
        FieldDefinition::text("sensorId"),
        FieldDefinition::new("timestamp", FieldType::Integer, FieldRole::Stored),
        FieldDefinition::number("value", FieldRole::Stored),
        FieldDefinition::number("minTimestamp", FieldRole::LowerBound("timestamp")),
        FieldDefinition::number("maxTimestamp", FieldRole::UpperBound("timestamp")),
        FieldDefinition::number("minValue", FieldRole::LowerBound("value")),
        FieldDefinition::number("maxValue", FieldRole::UpperBound("value")),
    ],
};
