/// Which lifecycle operations follow an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadeStyle {
    #[default]
    None,
    Persist,
    Remove,
    All,
}

impl CascadeStyle {
    pub fn includes_persist(&self) -> bool {
        matches!(self, Self::Persist | Self::All)
    }

    pub fn includes_remove(&self) -> bool {
        matches!(self, Self::Remove | Self::All)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationKind {
    /// This entity holds the foreign key column.
    ManyToOne { fk_column: String },
    /// The target entity holds the foreign key column `mapped_by`.
    OneToMany { mapped_by: String },
}

/// One edge of the cascade graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationMapping {
    pub name: String,
    pub target: String,
    pub kind: AssociationKind,
    pub cascade: CascadeStyle,
}

impl AssociationMapping {
    pub fn many_to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        fk_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: AssociationKind::ManyToOne {
                fk_column: fk_column.into(),
            },
            cascade: CascadeStyle::None,
        }
    }

    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: AssociationKind::OneToMany {
                mapped_by: mapped_by.into(),
            },
            cascade: CascadeStyle::None,
        }
    }

    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    pub fn is_many_to_one(&self) -> bool {
        matches!(self.kind, AssociationKind::ManyToOne { .. })
    }

    pub fn is_one_to_many(&self) -> bool {
        matches!(self.kind, AssociationKind::OneToMany { .. })
    }
}
